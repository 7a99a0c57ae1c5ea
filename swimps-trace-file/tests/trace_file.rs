use std::io::Write as _;

use swimps_error::ErrorCode;
use swimps_io::Permissions;
use swimps_time::TimeSpecification;
use swimps_trace::{Backtrace, RawBacktrace, Sample, StackFrame};
use swimps_trace_file::{finalise, Entry, TraceFile};

fn raw_backtrace(instruction_pointers: &[u64]) -> RawBacktrace {
    let mut backtrace = RawBacktrace::new();
    for (index, instruction_pointer) in instruction_pointers.iter().enumerate() {
        backtrace.instruction_pointers[index] = *instruction_pointer;
    }
    backtrace.count = instruction_pointers.len() as i32;
    backtrace
}

#[test]
fn backtrace_round_trips() {
    let mut trace_file = TraceFile::create_temporary("swimps_backtrace_round_trip").unwrap();

    let written = Backtrace {
        id: 9,
        stack_frame_ids: vec![0, 1, 2],
    };
    trace_file.add_backtrace(&written).unwrap();

    trace_file.seek_to_start().unwrap();

    // The first read consumes the file marker and lands on the entry.
    match trace_file.read_next_entry() {
        Entry::Backtrace(read) => {
            assert_eq!(read.id, 9);
            assert_eq!(read.stack_frame_ids, vec![0, 1, 2]);
        }
        other => panic!("expected a backtrace entry, got {other:?}"),
    }
}

#[test]
fn sample_round_trips() {
    let mut trace_file = TraceFile::create_temporary("swimps_sample_round_trip").unwrap();

    let written = Sample {
        backtrace_id: 7,
        timestamp: TimeSpecification {
            seconds: 123,
            nanoseconds: 456,
        },
    };
    trace_file.add_sample(&written).unwrap();

    trace_file.seek_to_start().unwrap();

    match trace_file.read_next_entry() {
        Entry::Sample(read) => assert_eq!(read, written),
        other => panic!("expected a sample entry, got {other:?}"),
    }
}

#[test]
fn stack_frame_round_trips() {
    let mut trace_file = TraceFile::create_temporary("swimps_stack_frame_round_trip").unwrap();

    let mut written = StackFrame::new(3, 0xDEADBEEF);
    written.offset = 0x42;
    written.line_number = 1337;
    written.set_function_name(b"_ZN6swimps4swimEv");
    written.set_source_file_path(b"/home/swimmer/swim.cpp");
    trace_file.add_stack_frame(&written).unwrap();

    trace_file.seek_to_start().unwrap();

    match trace_file.read_next_entry() {
        Entry::StackFrame(read) => {
            assert!(read.is_same_as(&written));
            assert_eq!(read.line_number, written.line_number);
            assert_eq!(read.source_file_path(), written.source_file_path());
        }
        other => panic!("expected a stack frame entry, got {other:?}"),
    }
}

#[test]
fn entries_read_back_in_the_order_they_were_written() {
    let mut trace_file = TraceFile::create_temporary("swimps_entry_order").unwrap();

    let sample = Sample {
        backtrace_id: 1,
        timestamp: TimeSpecification {
            seconds: 1,
            nanoseconds: 2,
        },
    };
    let backtrace = Backtrace {
        id: 1,
        stack_frame_ids: vec![4, 5],
    };
    let stack_frame = StackFrame::new(4, 0xA);

    trace_file.add_sample(&sample).unwrap();
    trace_file.add_backtrace(&backtrace).unwrap();
    trace_file.add_stack_frame(&stack_frame).unwrap();

    trace_file.seek_to_start().unwrap();

    assert!(matches!(trace_file.read_next_entry(), Entry::Sample(s) if s == sample));
    assert!(matches!(trace_file.read_next_entry(), Entry::Backtrace(b) if b == backtrace));
    assert!(
        matches!(trace_file.read_next_entry(), Entry::StackFrame(f) if f.is_same_as(&stack_frame))
    );
    assert!(matches!(
        trace_file.read_next_entry(),
        Entry::Error(ErrorCode::EndOfFile)
    ));
}

#[test]
fn empty_trace_file_ends_after_the_marker() {
    let mut trace_file = TraceFile::create_temporary("swimps_empty_file").unwrap();

    trace_file.seek_to_start().unwrap();

    assert!(matches!(
        trace_file.read_next_entry(),
        Entry::Error(ErrorCode::EndOfFile)
    ));

    let trace = trace_file.read_trace().unwrap();
    assert!(trace.samples.is_empty());
    assert!(trace.backtraces.is_empty());
    assert!(trace.stack_frames.is_empty());
}

#[test]
fn unknown_markers_stop_parsing() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("bad-marker");

    drop(TraceFile::create(&path).unwrap());

    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"zzzzz\n").unwrap();
    }

    let mut trace_file = TraceFile::open(&path, Permissions::ReadOnly).unwrap();
    trace_file.seek_to_start().unwrap();

    assert!(matches!(
        trace_file.read_next_entry(),
        Entry::Error(ErrorCode::UnknownEntryKind)
    ));
}

#[test]
fn truncated_entries_report_what_failed_to_read() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("truncated-sample");

    {
        let mut trace_file = TraceFile::create(&path).unwrap();
        let sample = Sample {
            backtrace_id: 1,
            timestamp: TimeSpecification {
                seconds: 0,
                nanoseconds: 0,
            },
        };
        trace_file.add_sample(&sample).unwrap();
    }

    // Chop the sample's payload in half.
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

    let mut trace_file = TraceFile::open(&path, Permissions::ReadOnly).unwrap();
    trace_file.seek_to_start().unwrap();

    assert!(matches!(
        trace_file.read_next_entry(),
        Entry::Error(ErrorCode::ReadSampleFailed)
    ));
}

#[test]
fn zero_frame_backtraces_are_corrupt() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("zero-frames");

    // An empty backtrace can only come from a corrupt writer; the sampling
    // agent never appends one. Produce it through the raw sink anyway.
    {
        let sink = TraceFile::create(&path).unwrap().into_raw_sink();
        sink.add_raw_sample(TimeSpecification::default(), &raw_backtrace(&[]))
            .unwrap();
        sink.close();
    }

    let mut trace_file = TraceFile::open(&path, Permissions::ReadOnly).unwrap();
    trace_file.seek_to_start().unwrap();

    assert!(matches!(
        trace_file.read_next_entry(),
        Entry::Error(ErrorCode::ReadBacktraceFailed)
    ));
}

#[test]
fn finaliser_deduplicates_backtraces_and_frames() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("raw-trace");

    let timestamp = |seconds| TimeSpecification {
        seconds,
        nanoseconds: 0,
    };

    {
        let sink = TraceFile::create(&path).unwrap().into_raw_sink();
        sink.add_raw_sample(timestamp(1), &raw_backtrace(&[0xA, 0xB]))
            .unwrap();
        sink.add_raw_sample(timestamp(2), &raw_backtrace(&[0xA, 0xB]))
            .unwrap();
        sink.add_raw_sample(timestamp(3), &raw_backtrace(&[0xA, 0xC]))
            .unwrap();
        sink.close();
    }

    finalise(&path).unwrap();

    let mut trace_file = TraceFile::open(&path, Permissions::ReadOnly).unwrap();
    let trace = trace_file.read_trace().unwrap();

    assert_eq!(trace.samples.len(), 3);
    assert_eq!(trace.backtraces.len(), 2);
    assert_eq!(trace.stack_frames.len(), 3);

    // The two identical captures share a backtrace; the third does not.
    assert_eq!(trace.samples[0].backtrace_id, trace.samples[1].backtrace_id);
    assert_ne!(trace.samples[0].backtrace_id, trace.samples[2].backtrace_id);

    // Samples keep their original order.
    assert_eq!(
        trace.samples.iter().map(|s| s.timestamp.seconds).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[test]
fn finalised_traces_satisfy_the_referential_invariants() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("invariant-trace");

    {
        let sink = TraceFile::create(&path).unwrap().into_raw_sink();
        for instruction_pointers in [
            &[0x10, 0x20, 0x30][..],
            &[0x10, 0x20][..],
            &[0x40][..],
            &[0x10, 0x20, 0x30][..],
        ] {
            sink.add_raw_sample(
                TimeSpecification::default(),
                &raw_backtrace(instruction_pointers),
            )
            .unwrap();
        }
        sink.close();
    }

    finalise(&path).unwrap();

    let trace = TraceFile::open(&path, Permissions::ReadOnly)
        .unwrap()
        .read_trace()
        .unwrap();

    // Every sample's backtrace resolves.
    for sample in &trace.samples {
        assert!(trace
            .backtraces
            .iter()
            .any(|backtrace| backtrace.id == sample.backtrace_id));
    }

    // Every backtrace's stack frame ids resolve.
    for backtrace in &trace.backtraces {
        assert!(!backtrace.stack_frame_ids.is_empty());
        for stack_frame_id in &backtrace.stack_frame_ids {
            assert!(trace
                .stack_frames
                .iter()
                .any(|stack_frame| stack_frame.id == *stack_frame_id));
        }
    }

    // No two backtraces are equivalent, and no two stack frames are.
    for (index, backtrace) in trace.backtraces.iter().enumerate() {
        for other in &trace.backtraces[index + 1..] {
            assert!(!backtrace.is_equivalent_to(other));
        }
    }

    for (index, stack_frame) in trace.stack_frames.iter().enumerate() {
        for other in &trace.stack_frames[index + 1..] {
            assert!(!stack_frame.is_equivalent_to(other));
        }
    }
}

#[test]
fn finalising_twice_is_harmless() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("double-finalised");

    {
        let sink = TraceFile::create(&path).unwrap().into_raw_sink();
        sink.add_raw_sample(TimeSpecification::default(), &raw_backtrace(&[0xA]))
            .unwrap();
        sink.close();
    }

    finalise(&path).unwrap();
    finalise(&path).unwrap();

    let trace = TraceFile::open(&path, Permissions::ReadOnly)
        .unwrap()
        .read_trace()
        .unwrap();

    assert_eq!(trace.samples.len(), 1);
    assert_eq!(trace.backtraces.len(), 1);
}

#[test]
fn opening_a_file_without_the_marker_fails() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("not-a-trace");
    std::fs::write(&path, b"not a swimps trace file").unwrap();

    assert!(matches!(
        TraceFile::open(&path, Permissions::ReadOnly),
        Err(ErrorCode::UnknownEntryKind)
    ));
}
