use chrono::{Duration, Utc};
use webvirt_orchestrator::ledger::NewVmRecord;
use webvirt_orchestrator::test_utils::{DirectoryFailPoint, HypervisorFailPoint, TestEnv};
use webvirt_orchestrator::{ExpiryReaper, OperationType, ReapReport, VmSpec};

fn reaper(env: &TestEnv) -> ExpiryReaper {
    ExpiryReaper::new(env.orchestrator.clone(), std::time::Duration::from_millis(10))
}

/// Creates a VM through the workflow, then backdates its expiry.
async fn expired_vm(env: &TestEnv, name: &str, owner: &str) -> webvirt_orchestrator::VmRecord {
    let record = env
        .orchestrator
        .create_vm(
            owner,
            &VmSpec {
                name: name.to_string(),
                core_count: 1,
                memory: 1024,
                duration: 30,
            },
        )
        .await
        .unwrap();

    sqlx::query("UPDATE virtual_machines SET expiry = ? WHERE id = ?")
        .bind((Utc::now() - Duration::minutes(1)).timestamp())
        .bind(record.id)
        .execute(&env.pool)
        .await
        .unwrap();

    record
}

#[tokio::test]
async fn test_cycles_without_expired_records_are_noops() {
    let env = TestEnv::new().await;
    env.orchestrator
        .create_vm(
            "alice",
            &VmSpec {
                name: "fresh".to_string(),
                core_count: 1,
                memory: 1024,
                duration: 60,
            },
        )
        .await
        .unwrap();
    let calls_before = env.hypervisor.calls().len();
    let reaper = reaper(&env);

    assert_eq!(reaper.run_cycle().await.unwrap(), ReapReport::default());
    assert_eq!(reaper.run_cycle().await.unwrap(), ReapReport::default());

    assert_eq!(env.hypervisor.calls().len(), calls_before);
    assert_eq!(env.orchestrator.list_vms("alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_expired_vm_is_reclaimed_everywhere() {
    let env = TestEnv::new().await;
    let record = expired_vm(&env, "lab-old", "alice").await;
    env.hypervisor.set_running(record.vmid, true);

    let report = reaper(&env).run_cycle().await.unwrap();

    assert_eq!(
        report,
        ReapReport {
            expired: 1,
            reclaimed: 1,
            failed: 0
        }
    );
    assert!(env.hypervisor.vm(record.vmid).is_none());
    assert!(env.directory.group("lab-old").is_none());
    assert!(env.orchestrator.ledger().get(record.id).await.unwrap().is_none());

    let calls = env.hypervisor.calls();
    let stop = calls.iter().position(|c| c == &format!("stop_vm {}", record.vmid));
    let delete = calls
        .iter()
        .rposition(|c| c == &format!("delete_vm {}", record.vmid));
    assert!(stop.unwrap() < delete.unwrap());
}

#[tokio::test]
async fn test_directory_failure_still_removes_ledger_row() {
    let env = TestEnv::new().await;
    let record = expired_vm(&env, "lab-old", "alice").await;
    env.directory.fail_on(DirectoryFailPoint::DeleteGroup);

    let report = reaper(&env).run_cycle().await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(env.hypervisor.vm(record.vmid).is_none());
    assert!(env.orchestrator.ledger().get(record.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_cycle() {
    let env = TestEnv::new().await;
    let first = expired_vm(&env, "lab-a", "alice").await;
    let second = expired_vm(&env, "lab-b", "bob").await;
    env.hypervisor.fail_on(HypervisorFailPoint::Stop);

    let report = reaper(&env).run_cycle().await.unwrap();

    assert_eq!(report.expired, 2);
    assert_eq!(report.failed, 2);
    // Rows go regardless; remote state is left for an operator
    assert!(env.orchestrator.ledger().get(first.id).await.unwrap().is_none());
    assert!(env.orchestrator.ledger().get(second.id).await.unwrap().is_none());

    let ops = env.orchestrator.journal().list(Some("lab-a")).await.unwrap();
    assert!(ops
        .iter()
        .any(|op| op.operation_type == OperationType::Reclaim && op.error.is_some()));
}

#[tokio::test]
async fn test_reaper_skips_records_deleted_meanwhile() {
    let env = TestEnv::new().await;
    let inserted = env
        .orchestrator
        .ledger()
        .insert(&NewVmRecord {
            vmid: 150,
            name: "ghost".to_string(),
            core_count: 1,
            memory: 512,
            port: 40,
            owner: "alice".to_string(),
            expiry: Some(Utc::now() - Duration::minutes(1)),
        })
        .await
        .unwrap();
    env.orchestrator.ledger().delete(inserted.id).await.unwrap();

    env.orchestrator.reclaim(&inserted).await.unwrap();
    assert!(env.hypervisor.calls().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_shutdown_signal() {
    let env = TestEnv::new().await;
    let record = expired_vm(&env, "lab-old", "alice").await;
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(reaper(&env).run(rx));

    // The first tick fires immediately
    for _ in 0..50 {
        if env.orchestrator.ledger().get(record.id).await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(env.orchestrator.ledger().get(record.id).await.unwrap().is_none());

    tx.send(true).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("reaper did not stop")
        .unwrap();
}
