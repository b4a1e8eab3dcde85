use crate::routes::admin::{BulkImportRequest, BulkImportResponse};
use crate::routes::session::{CredentialsRequest, CredentialsResponse};
use crate::routes::vms::AccessGroups;
use utoipa::OpenApi;
use webvirt_orchestrator::{
    Operation, OperationStatus, OperationType, PersonName, TenantCredentials, UpdateVmRequest,
    VmRecord, VmSpec,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::ping,
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::vms::list_vms,
        crate::routes::vms::create_vm,
        crate::routes::vms::update_vm,
        crate::routes::vms::delete_vm,
        crate::routes::vms::list_access,
        crate::routes::admin::bulk_import,
        crate::routes::admin::list_operations,
        crate::routes::session::verify_credentials,
    ),
    components(
        schemas(
            VmRecord,
            VmSpec,
            UpdateVmRequest,
            AccessGroups,
            PersonName,
            TenantCredentials,
            BulkImportRequest,
            BulkImportResponse,
            CredentialsRequest,
            CredentialsResponse,
            Operation,
            OperationStatus,
            OperationType
        )
    ),
    tags(
        (name = "webvirt-api", description = "VM lifecycle API")
    )
)]
pub struct ApiDoc;
