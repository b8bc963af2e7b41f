pub mod codec;
pub mod error;
pub mod hooks;
pub mod state;
pub mod transport;

pub use codec::{decode_envelope, struct_fields, to_snake_case, DecodeError, Envelope};
pub use error::{BoxError, DefinitionError};
pub use hooks::{
    hook_fn, Hook, HookCollection, HookContext, HookEvent, HookScope, UnsupportedHookEvent,
};
pub use state::{Params, SharedState};
pub use transport::{WsConn, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL};
