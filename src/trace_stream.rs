use crate::trace_frame::{FrameTime, RawData, TraceFrame};
use std::cell::RefCell;
use std::io;
use std::io::Write;
use std::rc::Rc;

pub type TraceWriterSharedPtr = Rc<RefCell<TraceWriter>>;

/// The sink the controller records into. The global-time counter lives
/// here: it advances once per frame, giving the trace its total order
/// across tasks. The container format proper (compression, indexing) is
/// another component's problem; `serialize_into` emits a trivial
/// length-prefixed byte stream for it to wrap.
pub struct TraceWriter {
    global_time: FrameTime,
    frames: Vec<TraceFrame>,
    raw_data: Vec<RawData>,
}

impl TraceWriter {
    pub fn new() -> TraceWriterSharedPtr {
        Rc::new(RefCell::new(TraceWriter {
            // Frame times start at 1 so that "time 0" is unambiguously
            // "before the trace began".
            global_time: 1,
            frames: Vec::new(),
            raw_data: Vec::new(),
        }))
    }

    /// The time the next frame will be stamped with.
    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    pub fn write_frame(&mut self, frame: TraceFrame) {
        debug_assert_eq!(frame.global_time, self.global_time);
        self.frames.push(frame);
        self.global_time += 1;
    }

    pub fn write_raw(&mut self, raw: RawData) {
        self.raw_data.push(raw);
    }

    pub fn frames(&self) -> &[TraceFrame] {
        &self.frames
    }

    pub fn raw_data(&self) -> &[RawData] {
        &self.raw_data
    }

    pub fn last_frame(&self) -> Option<&TraceFrame> {
        self.frames.last()
    }

    /// Emit every frame and raw record in stream order.
    pub fn serialize_into(&self, w: &mut dyn Write) -> io::Result<()> {
        for frame in &self.frames {
            w.write_all(&frame.global_time.to_le_bytes())?;
            w.write_all(&frame.thread_time.to_le_bytes())?;
            w.write_all(&frame.tid.to_le_bytes())?;
            w.write_all(&(frame.ev.event_type as u32).to_le_bytes())?;
            w.write_all(&frame.ev.data.to_le_bytes())?;
            w.write_all(&frame.rbc.to_le_bytes())?;
        }
        for raw in &self.raw_data {
            w.write_all(&raw.global_time.to_le_bytes())?;
            w.write_all(&(raw.addr.as_usize() as u64).to_le_bytes())?;
            w.write_all(&(raw.data.len() as u64).to_le_bytes())?;
            w.write_all(&raw.data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::remote_ptr::RemotePtr;

    fn frame_at(time: FrameTime) -> TraceFrame {
        TraceFrame {
            global_time: time,
            thread_time: 1,
            tid: 100,
            ev: Event::SyscallbufFlush.encode(),
            rbc: 0,
            recorded_regs: None,
            recorded_extra_regs: None,
        }
    }

    #[test]
    fn global_time_advances_per_frame() {
        let writer = TraceWriter::new();
        let mut w = writer.borrow_mut();
        assert_eq!(1, w.time());
        w.write_frame(frame_at(1));
        assert_eq!(2, w.time());
        w.write_frame(frame_at(2));
        assert_eq!(3, w.time());
        assert_eq!(2, w.frames().len());
    }

    #[test]
    fn raw_data_does_not_advance_time() {
        let writer = TraceWriter::new();
        let mut w = writer.borrow_mut();
        let global_time = w.time();
        w.write_raw(RawData {
            addr: RemotePtr::from_val(0x1000),
            data: vec![1, 2, 3],
            ev: Event::SyscallbufFlush.encode(),
            global_time,
        });
        assert_eq!(1, w.time());
        assert_eq!(1, w.raw_data().len());
    }

    #[test]
    fn serialize_emits_all_frames() {
        let writer = TraceWriter::new();
        let mut w = writer.borrow_mut();
        w.write_frame(frame_at(1));
        let mut out: Vec<u8> = Vec::new();
        w.serialize_into(&mut out).unwrap();
        assert!(!out.is_empty());
    }
}
