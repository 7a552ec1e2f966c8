//! Message types exchanged between the capture tasks, the session and playback.

/// Capture-side audio format: 16 kHz mono S16LE.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Playback-side audio format: 24 kHz mono S16LE.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
pub const CHANNELS: u8 = 1;
/// Frames per capture read (2048 bytes of S16LE mono).
pub const CHUNK_FRAMES: usize = 1024;

/// Raw PCM from the microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub pcm: Vec<u8>,
}

impl AudioChunk {
    pub fn new(pcm: Vec<u8>) -> Self {
        Self { pcm }
    }

    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", CAPTURE_SAMPLE_RATE)
    }
}

/// One encoded screen snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

impl ImageFrame {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            data,
            mime_type: "image/jpeg",
        }
    }
}

/// Operator-authored text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTurn {
    pub text: String,
    /// Whether this text closes the operator's conversational turn.
    pub end_of_turn: bool,
}

impl TextTurn {
    /// A complete turn. Empty input becomes `"."` since the session rejects
    /// empty turns.
    pub fn complete(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            text: if text.is_empty() { ".".to_string() } else { text },
            end_of_turn: true,
        }
    }
}

/// Everything that can be sent to the remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Audio(AudioChunk),
    Frame(ImageFrame),
    Text(TextTurn),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Audio(_) => "audio",
            Outbound::Frame(_) => "frame",
            Outbound::Text(_) => "text",
        }
    }
}

impl From<AudioChunk> for Outbound {
    fn from(chunk: AudioChunk) -> Self {
        Outbound::Audio(chunk)
    }
}

impl From<ImageFrame> for Outbound {
    fn from(frame: ImageFrame) -> Self {
        Outbound::Frame(frame)
    }
}

impl From<TextTurn> for Outbound {
    fn from(turn: TextTurn) -> Self {
        Outbound::Text(turn)
    }
}

/// A reply from the remote session, classified once on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReply {
    /// 24 kHz mono S16LE PCM
    Audio(Vec<u8>),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_turn_gets_placeholder() {
        assert_eq!(TextTurn::complete("").text, ".");
        assert_eq!(TextTurn::complete("hi").text, "hi");
        assert!(TextTurn::complete("hi").end_of_turn);
    }

    #[test]
    fn audio_mime_type_carries_capture_rate() {
        assert_eq!(AudioChunk::new(vec![]).mime_type(), "audio/pcm;rate=16000");
    }
}
