use crate::error::{OrchestratorError, Result};
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

pub const MIN_PASSWORD_LEN: usize = 4;
pub const DEFAULT_PASSWORD_LEN: usize = 8;

/// Random password of exactly `length` characters with at least one
/// lowercase letter, one uppercase letter and one digit.
pub fn generate_password(length: usize) -> Result<String> {
    if length < MIN_PASSWORD_LEN {
        return Err(OrchestratorError::Validation(format!(
            "password length must be at least {MIN_PASSWORD_LEN}, got {length}"
        )));
    }

    let mut rng = rand::rng();
    let alphabet: Vec<u8> = [LOWERCASE, UPPERCASE, DIGITS].concat();

    let mut chars: Vec<u8> = Vec::with_capacity(length);
    for class in [LOWERCASE, UPPERCASE, DIGITS] {
        if let Some(c) = class.choose(&mut rng) {
            chars.push(*c);
        }
    }
    while chars.len() < length {
        chars.push(alphabet[rng.random_range(0..alphabet.len())]);
    }
    chars.shuffle(&mut rng);

    Ok(chars.into_iter().map(char::from).collect())
}

/// Lowercased name with whitespace removed, as used in usernames.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
