//! screenchat - voice, screen and text conversation with Gemini Live
//!
//! Local capture tasks feed bounded queues toward one remote session; replies
//! are split back into speaker playback and console text. The [`supervisor`]
//! owns the lifecycle of every task and device.

#![forbid(unsafe_code)]

pub mod audio;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod gemini;
pub mod media_in;
pub mod playback;
pub mod receiver;
pub mod retry;
pub mod run_state;
pub mod screen;
pub mod session;
pub mod supervisor;
pub mod text_input;

#[cfg(test)]
mod testing;
