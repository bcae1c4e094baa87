/// One reassembled upstream SSE frame.
///
/// `event` is the value of the `event:` line when present; `data` is the
/// joined payload of the `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

/// Reassembles provider SSE frames from a byte stream split at arbitrary
/// offsets.
///
/// Invariant: a partial trailing frame is retained across pushes and never
/// parsed prematurely; the parsed frame sequence is identical no matter how
/// the bytes were chunked. Line splitting happens on raw bytes before any
/// UTF-8 decoding, so a chunk boundary inside a multi-byte character cannot
/// corrupt the frame.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// Trailing partial line carried over between pushes
    partial_line: Vec<u8>,
    /// Complete lines of the frame currently being assembled
    pending_lines: Vec<String>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, yielding every frame completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.partial_line.extend_from_slice(chunk);

        let mut frames = Vec::new();
        // 保留最后一行（可能不完整）
        while let Some(newline) = self.partial_line.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.partial_line.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // 空行表示一个事件结束
                if let Some(frame) = parse_frame(&self.pending_lines) {
                    frames.push(frame);
                }
                self.pending_lines.clear();
            } else {
                self.pending_lines.push(line.to_string());
            }
        }
        frames
    }
}

/// Parse the `event:`/`data:` lines of one complete frame block.
///
/// Blocks without a `data:` line (comments, bare `event:` lines) yield
/// nothing. Multiple `data:` lines are joined with newlines per the SSE
/// grammar.
fn parse_frame(lines: &[String]) -> Option<Frame> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in lines {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(Frame {
        event,
        data: data_lines.join("\n"),
    })
}
