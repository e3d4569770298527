pub mod event;
pub mod id;
pub mod job;
pub mod room;
pub mod video;

pub use event::{StatusEvent, STATUS_EVENT_KIND};
pub use id::{RoomId, VideoId};
pub use job::TranscodeJob;
pub use room::{channel_for_code, Room};
pub use video::{Video, VideoStatus};
