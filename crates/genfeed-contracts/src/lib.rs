pub mod events;
pub mod patch;
pub mod requests;
pub mod signals;
pub mod snapshot;
