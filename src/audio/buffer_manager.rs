//! Underrun-driven sizing of the low-latency playout buffer.
//!
//! Runs once per playout write. Any underrun grows the buffer by one 10 ms
//! block (at most `MAX_BUFFER_INCREASES` times) and turns off shrinking for the
//! rest of the session; until the first underrun, the buffer is trimmed by one
//! block every `TICKS_UNTIL_DECREASE` writes, never below one block.

use super::device::BufferSizeControl;
use super::format::BUFFERS_PER_SECOND;

const TICKS_UNTIL_DECREASE: i32 = 10;
const MAX_BUFFER_INCREASES: u32 = 5;

#[derive(Debug, Clone)]
pub struct LowLatencyBufferManager {
    prev_underrun_count: u32,
    ticks_until_next_decrease: i32,
    keep_lowering_buffer_size: bool,
    buffer_increase_counter: u32,
}

impl Default for LowLatencyBufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LowLatencyBufferManager {
    pub fn new() -> Self {
        Self {
            prev_underrun_count: 0,
            ticks_until_next_decrease: TICKS_UNTIL_DECREASE,
            keep_lowering_buffer_size: true,
            buffer_increase_counter: 0,
        }
    }

    pub fn maybe_adjust_buffer_size<D>(&mut self, device: &D)
    where
        D: BufferSizeControl + ?Sized,
    {
        let Some(underrun_count) = device.underrun_count() else {
            return;
        };
        let block_frames = (device.playback_rate() / BUFFERS_PER_SECOND) as usize;

        if underrun_count > self.prev_underrun_count {
            if self.buffer_increase_counter < MAX_BUFFER_INCREASES {
                let current = device.buffer_size_in_frames();
                let applied = device.set_buffer_size_in_frames(current + block_frames);
                self.buffer_increase_counter += 1;
                log::info!(
                    "Underrun count {} -> {}: playout buffer {} -> {} frames",
                    self.prev_underrun_count,
                    underrun_count,
                    current,
                    applied
                );
            }
            self.keep_lowering_buffer_size = false;
            self.prev_underrun_count = underrun_count;
            self.ticks_until_next_decrease = TICKS_UNTIL_DECREASE;
        } else if self.keep_lowering_buffer_size {
            self.ticks_until_next_decrease -= 1;
            if self.ticks_until_next_decrease <= 0 {
                let current = device.buffer_size_in_frames();
                let target = block_frames.max(current.saturating_sub(block_frames));
                if target != current {
                    let applied = device.set_buffer_size_in_frames(target);
                    log::debug!("Lowering playout buffer {} -> {} frames", current, applied);
                }
                self.ticks_until_next_decrease = TICKS_UNTIL_DECREASE;
            }
        }
    }

    pub fn buffer_increase_count(&self) -> u32 {
        self.buffer_increase_counter
    }

    pub fn is_lowering_buffer_size(&self) -> bool {
        self.keep_lowering_buffer_size
    }
}
