//! Local capture tasks feeding the outbound channels.

pub mod audio;
pub mod video;
