/*++

Licensed under the Apache-2.0 license.

File Name:

    stream.rs

Abstract:

    Avalon-ST source for the receive engine: queued packets or the
    free-running pulse counter.

--*/

use std::collections::VecDeque;

struct Chunk {
    data: VecDeque<u8>,
    /// The chunk ends a packet.
    eop: bool,
}

/// Avalon-ST data feeding the device-to-host engine.
#[derive(Default)]
pub struct StreamSource {
    chunks: VecDeque<Chunk>,
    /// Free-running big-endian 16-bit counter, the pulse counter's output.
    counter: Option<u64>,
}

impl StreamSource {
    pub fn push(&mut self, data: &[u8], eop: bool) {
        if data.is_empty() && !eop {
            return;
        }
        self.chunks.push_back(Chunk {
            data: data.iter().copied().collect(),
            eop,
        });
    }

    pub fn set_counter(&mut self, enabled: bool) {
        self.counter = enabled.then_some(0);
    }

    pub fn available(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    /// Takes up to `len` bytes for one descriptor. With `end_on_eop` the
    /// transfer stops early at the end of a packet. Returns `None` until
    /// enough data has arrived.
    pub fn take(&mut self, len: usize, end_on_eop: bool) -> Option<Vec<u8>> {
        if let Some(position) = self.counter.as_mut() {
            let bytes = (0..len as u64)
                .map(|k| {
                    let n = *position + k;
                    ((n / 2) as u16).to_be_bytes()[(n % 2) as usize]
                })
                .collect();
            *position += len as u64;
            return Some(bytes);
        }

        let mut reachable = 0;
        let mut ends_early = false;
        for chunk in &self.chunks {
            reachable += chunk.data.len();
            if reachable >= len {
                break;
            }
            if end_on_eop && chunk.eop {
                ends_early = true;
                break;
            }
        }
        if reachable < len && !ends_early {
            return None;
        }

        let mut out = Vec::with_capacity(len.min(reachable));
        while out.len() < len {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };
            let n = (len - out.len()).min(chunk.data.len());
            out.extend(chunk.data.drain(..n));
            if chunk.data.is_empty() {
                let eop = chunk.eop;
                self.chunks.pop_front();
                if eop && end_on_eop {
                    break;
                }
            }
        }
        Some(out)
    }
}
