pub mod state;

pub use state::{ChannelState, ChannelStateChange};
