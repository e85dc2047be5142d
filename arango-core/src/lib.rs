pub mod crd;
pub mod error;

pub use error::{AppError, AppResult};

/// Comma-separated list of canonical label selectors which match the operator's labelling scheme.
pub const ARANGO_OPERATOR_LABEL_SELECTORS: &str = "app=arangodb,arangodb.com/controlled-by=arango-operator";

/// The label used to tie a Kubernetes object to the deployment which owns it.
pub const LABEL_ARANGO_DEPLOYMENT: &str = "arango_deployment";
/// The label carrying the role of the server group an object belongs to.
pub const LABEL_ROLE: &str = "role";
/// The label carrying the ID of the member an object belongs to.
pub const LABEL_MEMBER_ID: &str = "arango_member";
