pub mod lifecycle;
pub mod resource;
pub mod router;
pub mod template;

mod dispatch;
#[cfg(test)]
mod testutil;

pub use lifecycle::{DispatchError, Session};
pub use resource::{
    BoxedResource, ChildContext, FactoryContext, HandlerFn, HandlerResult, Resource,
    ResourceConfig,
};
pub use router::{
    url_params, ConnectError, ConnectRequest, ResourceFactory, RouteInfo, Router, RouterConfig,
};
pub use template::{RouteTemplate, UrlError};
