pub mod constants;
pub mod errors;
pub mod layout;
#[cfg(windows)]
mod platform;
pub mod ring;
pub mod segment;

pub use errors::SegmentError;
pub use layout::{
    AddressRange, BasicBlockEvent, Command, CommandRecord, Event, EventRecord, ModuleEvent,
    RingHeader, ShmHeader, ShmLayout,
};
pub use ring::{PushOutcome, Ring};
pub use segment::Segment;
