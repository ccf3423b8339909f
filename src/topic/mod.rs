//! Publish/subscribe fan-out with attribute filtering.
//!
//! # Example
//!
//! ```ignore
//! let topic = Topic::new("uploads");
//! topic.subscribe_queued("logger", Filter::kinds([EventKind::UploadCreated]), queue)?;
//! topic.subscribe_direct(
//!     "captions",
//!     Filter::attribute_in("metadata_type", ["Caption"]),
//!     handler,
//! )?;
//!
//! let report = topic.publish(&event);
//! ```

mod bus;
mod filter;

pub(crate) use bus::panic_message;
pub use bus::{DeliveryMode, PublishReport, Topic};
pub use filter::{Constraint, Filter};
