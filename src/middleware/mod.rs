mod authorize;
mod request_id;

pub use authorize::{
    AdminContext, Authorizer, NAMESPACE_PATH_PREFIX, NamespaceContext, Rejection,
    admin_auth_middleware, namespace_auth_middleware, namespace_code_from_path,
};
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
