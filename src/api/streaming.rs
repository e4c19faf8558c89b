// SSE plumbing between upstream chunk frames and client responses

/// Reassembles SSE `data:` payloads from arbitrarily split chunk frames.
/// The residual partial line is carried between pushes.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of upstream bytes; returns the complete `data:`
    /// payloads that became available.
    pub fn push(&mut self, data: &str) -> Vec<String> {
        self.buffer.push_str(data);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(rest) = line.strip_prefix("data:") {
                let payload = rest.trim();
                if !payload.is_empty() {
                    payloads.push(payload.to_string());
                }
            }
        }

        payloads
    }

    /// Whatever is left after the upstream closed without a trailing newline.
    pub fn residual(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        let line = line.trim();
        line.strip_prefix("data:").map(|rest| rest.trim().to_string()).filter(|p| !p.is_empty())
    }
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";
