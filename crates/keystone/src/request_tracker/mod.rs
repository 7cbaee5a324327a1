pub use self::fs_events::*;
pub use self::request::*;
pub use self::request_graph::*;
pub use self::request_tracker::*;
pub use self::serialization::CacheLoadError;

mod fs_events;
mod request;
mod request_graph;

#[allow(clippy::module_inception)]
mod request_tracker;

mod serialization;
