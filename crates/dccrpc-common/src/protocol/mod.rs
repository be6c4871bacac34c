pub mod calls;
pub mod error;
pub mod requests;
pub mod responses;


pub use calls::{BatchResult, CallSpec, AUTH_TOKEN_KWARG, VERSION_KWARG};
pub use error::{Result, RpcError};
pub use requests::{Request, RequestId, ServiceMethod};
pub use responses::Response;
