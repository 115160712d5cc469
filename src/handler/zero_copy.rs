//! Block recording straight from the latency buffer's memory.
//!
//! When the buffer is a page-aligned contiguous ring and the streaming chunk
//! size is a 4096-multiple, recording can bypass the element-by-element
//! writer entirely: whole chunks of raw buffer memory go to the output file
//! with plain `write(2)` calls, optionally `O_DIRECT`. Leading elements that
//! do not sit on an alignment boundary are skipped on the first pass; the
//! wrap at the end of the ring and the final partial element are written
//! with `O_DIRECT` temporarily lifted, since they cannot satisfy the
//! alignment contract.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{CleanupGate, Counters};
use crate::buffer::{LatencyBuffer, LookupStart};
use crate::config::DataRecorderConfig;
use crate::error::{ReadoutError, Result};
use crate::frame::FrameType;
use crate::types::SourceId;

/// Chunks considered per gate acquisition before re-checking the wall clock.
const CHUNKS_PER_PASS: usize = 100;

pub(crate) struct ZeroCopyRecorder {
    fd: i32,
    oflag: i32,
    path: PathBuf,
    chunk_size: usize,
}

// SAFETY: the fd is owned exclusively by the recorder; all writes happen on
// the single recording thread.
unsafe impl Send for ZeroCopyRecorder {}

impl ZeroCopyRecorder {
    /// Validates alignment constraints against the buffer and opens the
    /// output file. The file name is `<configured>_<source_id>.bin`.
    pub(crate) fn configure<F: FrameType, B: LatencyBuffer<F>>(
        cfg: &DataRecorderConfig,
        buffer: &Arc<B>,
        sourceid: SourceId,
    ) -> Result<Self> {
        let region = buffer.contiguous_region().ok_or_else(|| {
            ReadoutError::configuration(sourceid, "latency buffer is not contiguous")
        })?;
        let alignment = buffer.alignment_size();
        if alignment == 0 || region.len % 4096 != 0 {
            return Err(ReadoutError::configuration(
                sourceid,
                "latency buffer is not 4kB aligned",
            ));
        }
        if cfg.streaming_buffer_size == 0 || cfg.streaming_buffer_size % 4096 != 0 {
            return Err(ReadoutError::configuration(
                sourceid,
                "streaming chunk size is not divisible by 4kB",
            ));
        }

        let path = PathBuf::from(format!(
            "{}_{}.bin",
            cfg.output_file.display(),
            sourceid
        ));
        if std::fs::remove_file(&path).is_ok() {
            debug!(path = %path.display(), "removed existing output file from previous run");
        }

        let mut oflag = libc::O_CREAT | libc::O_WRONLY;
        if cfg.use_o_direct {
            oflag |= libc::O_DIRECT;
        }
        let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            ReadoutError::configuration(sourceid, "output path contains NUL")
        })?;
        // SAFETY: plain open(2) on an owned CString.
        let fd = unsafe { libc::open(cpath.as_ptr(), oflag, 0o644) };
        if fd == -1 {
            return Err(ReadoutError::configuration(sourceid, "failed to open file"));
        }
        debug!(path = %path.display(), o_direct = cfg.use_o_direct, "zero-copy recorder ready");
        Ok(Self {
            fd,
            oflag,
            path,
            chunk_size: cfg.streaming_buffer_size,
        })
    }

    fn write_block(&self, ptr: *const u8, len: usize) -> bool {
        // SAFETY: the caller passes a range inside the latency-buffer
        // region, which outlives the recorder thread.
        let written = unsafe { libc::write(self.fd, ptr as *const libc::c_void, len) };
        written == len as isize
    }

    /// Writes an alignment-breaking range with `O_DIRECT` lifted.
    fn write_unaligned(&self, ptr: *const u8, len: usize) -> bool {
        // SAFETY: flag toggles on the owned fd around a plain write.
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, libc::O_CREAT | libc::O_WRONLY);
            let ok = self.write_block(ptr, len);
            libc::fcntl(self.fd, libc::F_SETFL, self.oflag);
            ok
        }
    }

    /// Recording thread body. Walks a raw write pointer through the ring's
    /// memory region, chunk by chunk, trailing the producer.
    pub(crate) fn record<F: FrameType, B: LatencyBuffer<F>>(
        slot: &Mutex<Option<Self>>,
        buffer: &Arc<B>,
        gate: &CleanupGate,
        next_timestamp_to_record: &AtomicU64,
        counters: &Counters,
        duration: Duration,
    ) {
        let guard = slot.lock();
        let recorder = match guard.as_ref() {
            Some(recorder) => recorder,
            None => return,
        };
        let region = buffer
            .contiguous_region()
            .expect("validated during configure");
        let alignment = buffer.alignment_size().max(1);
        let element_size = region.element_size;
        let start_of_buffer = region.start;
        // SAFETY: one past the end of the owned region, never dereferenced.
        let end_of_buffer = unsafe { start_of_buffer.add(region.len) };
        let chunk_size = recorder.chunk_size;

        info!(seconds = duration.as_secs(), "start zero-copy recording");
        next_timestamp_to_record.store(0, Ordering::Release);
        let mut write_pointer: *const u8 = std::ptr::null();
        let mut bytes_written = 0u64;
        let mut failed_writes = 0u64;
        let started = Instant::now();

        while started.elapsed() < duration {
            let _request = gate.begin_request();

            if next_timestamp_to_record.load(Ordering::Acquire) == 0 {
                // Skip unaligned leading elements; O_DIRECT needs the source
                // address aligned as well as the length.
                let mut first: Option<(*const u8, u64)> = None;
                let mut skipped_frames = 0usize;
                buffer.for_each_from(LookupStart::Begin, true, &mut |element| {
                    let address = element as *const F as *const u8;
                    if address as usize % alignment == 0 {
                        first = Some((address, element.timestamp()));
                        std::ops::ControlFlow::Break(())
                    } else {
                        skipped_frames += 1;
                        std::ops::ControlFlow::Continue(())
                    }
                });
                match first {
                    Some((address, ts)) => {
                        debug!(skipped_frames, "aligned recording start located");
                        write_pointer = address;
                        next_timestamp_to_record.store(ts, Ordering::Release);
                    }
                    None => {
                        drop(_request);
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                }
            }

            let current_end = match buffer.back_frame_ptr() {
                Some(ptr) => ptr as *const u8,
                None => {
                    drop(_request);
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };

            let mut considered_chunks = 0usize;
            while considered_chunks < CHUNKS_PER_PASS {
                debug_assert_eq!(write_pointer as usize % alignment, 0);
                let mut failed_write = false;
                // Address comparisons in usize space so a chunk reaching
                // past the region never forms an out-of-bounds pointer.
                let write_addr = write_pointer as usize;
                if write_addr + chunk_size < current_end as usize {
                    // A whole chunk of not-yet-recorded data.
                    failed_write = !recorder.write_block(write_pointer, chunk_size);
                    if !failed_write {
                        bytes_written += chunk_size as u64;
                    }
                    // SAFETY: chunk end checked against the region above.
                    write_pointer = unsafe { write_pointer.add(chunk_size) };
                } else if (current_end as usize) < write_addr {
                    // Producer has wrapped behind us.
                    if write_addr + chunk_size < end_of_buffer as usize {
                        failed_write = !recorder.write_block(write_pointer, chunk_size);
                        if !failed_write {
                            bytes_written += chunk_size as u64;
                        }
                        // SAFETY: chunk end checked against the region above.
                        write_pointer = unsafe { write_pointer.add(chunk_size) };
                    } else {
                        // Tail of the region: unaligned length.
                        let tail = end_of_buffer as usize - write_addr;
                        failed_write = !recorder.write_unaligned(write_pointer, tail);
                        if !failed_write {
                            bytes_written += tail as u64;
                        }
                        write_pointer = start_of_buffer;
                    }
                } else {
                    // Caught up with the producer.
                    break;
                }
                if write_pointer == end_of_buffer {
                    write_pointer = start_of_buffer;
                }
                if failed_write {
                    failed_writes += 1;
                    warn!(path = %recorder.path.display(), "could not write to file");
                }
                considered_chunks += 1;

                // Cursor of the last element written out completely; the
                // cleanup thread must not pop past it.
                let offset = write_pointer as usize - start_of_buffer as usize;
                let floored = (offset / element_size) * element_size;
                // SAFETY: floored < region.len, element-aligned slot.
                let last_complete = unsafe { start_of_buffer.add(floored) as *const F };
                next_timestamp_to_record
                    .store(unsafe { (*last_complete).timestamp() }, Ordering::Release);
            }
        }

        // Complete the partially-written element so no frame is torn.
        if !write_pointer.is_null() {
            let offset = write_pointer as usize - start_of_buffer as usize;
            let floored = (offset / element_size) * element_size;
            // SAFETY: element-aligned slot inside the region.
            let last_started = unsafe { start_of_buffer.add(floored) };
            if last_started != write_pointer {
                let remainder =
                    (last_started as usize + element_size) - write_pointer as usize;
                if recorder.write_unaligned(write_pointer, remainder) {
                    bytes_written += remainder as u64;
                } else {
                    failed_writes += 1;
                    warn!(path = %recorder.path.display(), "could not write to file");
                }
            }
        }

        next_timestamp_to_record.store(u64::MAX, Ordering::Release);
        counters
            .bytes_recorded
            .fetch_add(bytes_written, Ordering::Relaxed);
        counters
            .failed_record_writes
            .fetch_add(failed_writes, Ordering::Relaxed);
        info!(bytes_written, failed_writes, "stopped zero-copy recording");
    }
}

impl Drop for ZeroCopyRecorder {
    fn drop(&mut self) {
        // SAFETY: closing the owned fd exactly once.
        unsafe { libc::close(self.fd) };
    }
}
