pub mod ids;
pub mod messages;
pub mod protocol;
pub mod records;

pub use ids::{ConnectionId, UserId};
pub use messages::{Message, MessageContext, MessageDraft};
pub use protocol::{Event, FrameError, Request, Response};
pub use records::Record;
