//! Domain model: identifiers, task records, errors and events.

pub mod errors;
pub mod events;
pub mod ids;
pub mod task;

pub use self::errors::{ErrorKind, HandlerError, SpindleError};
pub use self::events::TaskEvent;
pub use self::ids::{LeaseId, ParseIdError, TaskId};
pub use self::task::{TaskRecord, TaskStatus, TaskType};
