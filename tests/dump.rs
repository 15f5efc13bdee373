use std::ffi::CString;
use std::fs;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crashtrace::{Config, ErrorCallback, Frame, InitError, Symbolizer};
use parking_lot::Mutex;

// The reporter is a process-wide singleton.
static SERIAL: Mutex<()> = parking_lot::const_mutex(());

const BANNER: &str = "\n*************** BACKTRACES: ***************\n";

fn c_path(path: &Path) -> CString {
    CString::new(path.to_str().unwrap()).unwrap()
}

/// Replays a fixed list of frames and upper-cases names starting with `m_`.
struct Scripted {
    frames: Vec<(Option<&'static str>, u32, Option<&'static str>)>,
    fail_after: Option<usize>,
    walks: AtomicUsize,
}

impl Scripted {
    fn new(frames: Vec<(Option<&'static str>, u32, Option<&'static str>)>) -> Self {
        Self {
            frames,
            fail_after: None,
            walks: AtomicUsize::new(0),
        }
    }

    /// Reports an unwinder error and gives up after `count` frames.
    fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }
}

impl Symbolizer for Scripted {
    fn walk(
        &self,
        skip: usize,
        on_frame: &mut dyn FnMut(&Frame<'_>) -> ControlFlow<()>,
        on_error: ErrorCallback,
    ) {
        self.walks.fetch_add(1, Ordering::SeqCst);
        for (pc, &(file, line, function)) in self.frames.iter().enumerate().skip(skip) {
            if self.fail_after == Some(pc - skip) {
                on_error("frame table is corrupt", -1);
                return;
            }
            let frame = Frame {
                pc: 0x1000 + pc,
                filename: file.map(str::as_bytes),
                line: Some(line),
                function: function.map(str::as_bytes),
            };
            if on_frame(&frame).is_break() {
                return;
            }
        }
    }

    fn demangle(&self, mangled: &[u8], out: &mut [u8]) -> Option<usize> {
        let rest = mangled.strip_prefix(b"m_")?;
        let out = out.get_mut(..rest.len())?;
        for (o, c) in out.iter_mut().zip(rest) {
            *o = c.to_ascii_uppercase();
        }
        Some(rest.len())
    }
}

fn frame_lines(report: &str) -> Vec<&str> {
    report.lines().filter(|l| l.starts_with('#')).collect()
}

#[test]
fn dump_writes_header_and_signal_names() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    crashtrace::init(255).unwrap();

    let cases = [
        (libc::SIGILL, "SIGILL"),
        (libc::SIGTRAP, "SIGTRAP"),
        (libc::SIGABRT, "SIGABRT"),
        (libc::SIGFPE, "SIGFPE"),
        (libc::SIGSEGV, "SIGSEGV"),
        (libc::SIGTERM, "SIGTERM"),
        (libc::SIGUSR1, "unknown signal"),
        (12345, "unknown signal"),
    ];
    for &(signal, name) in cases.iter() {
        let path = dir.path().join(format!("{}.dump", signal));
        crashtrace::dump(signal, &c_path(&path));

        let report = fs::read_to_string(&path).unwrap();
        assert!(report.starts_with(BANNER), "{:?}", report);
        let exe = std::env::current_exe().unwrap();
        assert!(report.contains(&format!("EXECUTABLE: {}\n", exe.display())));
        assert!(report.contains("\nTIMESTAMP:  "));
        assert!(report.contains(&format!("\nSIGNAL:     {}\n\n", name)));
    }

    crashtrace::deinit();
}

#[test]
fn dump_appends_and_uses_mode_0644() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.log");
    fs::write(&path, "existing\n").unwrap();

    crashtrace::init(4).unwrap();
    crashtrace::dump(libc::SIGSEGV, &c_path(&path));
    crashtrace::dump(libc::SIGABRT, &c_path(&path));
    crashtrace::deinit();

    let report = fs::read_to_string(&path).unwrap();
    assert!(report.starts_with("existing\n"));
    assert_eq!(report.matches(BANNER).count(), 2);

    let fresh = dir.path().join("fresh.log");
    crashtrace::init(4).unwrap();
    crashtrace::dump(libc::SIGSEGV, &c_path(&fresh));
    crashtrace::deinit();
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(&fresh).unwrap().permissions().mode();
    assert_eq!(mode & 0o022, 0);
    assert_eq!(mode & 0o600, 0o600);
}

#[test]
fn dump_to_unopenable_path_is_silent() {
    let _serial = SERIAL.lock();
    crashtrace::init(8).unwrap();
    crashtrace::dump(
        libc::SIGSEGV,
        &CString::new("/nonexistent-dir/sub/trace.log").unwrap(),
    );
    crashtrace::deinit();
}

#[test]
fn frames_are_indexed_skipped_and_demangled() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frames.log");

    let scripted = Scripted::new(vec![
        (Some("src/a.rs"), 10, Some("m_inner")),
        (None, 11, Some("m_nofile")),
        (Some("src/b.rs"), 0, Some("m_noline")),
        (Some("src/c.rs"), 12, None),
        (Some("src/d.rs"), 13, Some("raw_name")),
        (Some("src/e.rs"), 14, Some("m_outer")),
    ]);
    crashtrace::init_with(&Config::default(), scripted).unwrap();
    crashtrace::dump(libc::SIGSEGV, &c_path(&path));

    let report = fs::read_to_string(&path).unwrap();
    assert_eq!(
        frame_lines(&report),
        [
            "#0:  INNER  at  src/a.rs:10",
            "#4:  raw_name  at  src/d.rs:13",
            "#5:  OUTER  at  src/e.rs:14",
        ]
    );

    // The index starts again from zero on the next capture.
    crashtrace::dump(libc::SIGABRT, &c_path(&path));
    let report = fs::read_to_string(&path).unwrap();
    assert_eq!(report.matches("#0:  INNER  at  src/a.rs:10\n").count(), 2);

    crashtrace::deinit();
}

#[test]
fn walk_stops_past_max_depth() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("depth.log");

    let frames = (0..10)
        .map(|_| (Some("src/loop.rs"), 7, Some("m_f")))
        .collect();
    crashtrace::init_with(&Config::default().with_max_depth(2), Scripted::new(frames)).unwrap();
    crashtrace::dump(libc::SIGSEGV, &c_path(&path));
    crashtrace::dump(libc::SIGSEGV, &c_path(&path));
    crashtrace::deinit();

    // The second capture starts again from #0.
    let report = fs::read_to_string(&path).unwrap();
    assert_eq!(
        frame_lines(&report),
        [
            "#0:  F  at  src/loop.rs:7",
            "#1:  F  at  src/loop.rs:7",
            "#2:  F  at  src/loop.rs:7",
            "#0:  F  at  src/loop.rs:7",
            "#1:  F  at  src/loop.rs:7",
            "#2:  F  at  src/loop.rs:7",
        ]
    );
}

#[test]
fn unwinder_error_ends_the_walk() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("error.log");

    let scripted = Scripted::new(vec![
        (Some("src/a.rs"), 1, Some("m_first")),
        (Some("src/a.rs"), 2, Some("m_second")),
        (Some("src/a.rs"), 3, Some("m_third")),
        (Some("src/a.rs"), 4, Some("m_fourth")),
    ])
    .failing_after(2);
    crashtrace::init_with(&Config::default(), scripted).unwrap();
    crashtrace::dump(libc::SIGABRT, &c_path(&path));
    crashtrace::dump(libc::SIGABRT, &c_path(&path));
    crashtrace::deinit();

    let report = fs::read_to_string(&path).unwrap();
    assert_eq!(report.matches(BANNER).count(), 2);
    assert_eq!(
        frame_lines(&report),
        [
            "#0:  FIRST  at  src/a.rs:1",
            "#1:  SECOND  at  src/a.rs:2",
            "#0:  FIRST  at  src/a.rs:1",
            "#1:  SECOND  at  src/a.rs:2",
        ]
    );
}

#[test]
fn report_follows_configured_output() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("configured.log");

    let config = Config::default()
        .with_output_file(path.to_str().unwrap())
        .unwrap();
    crashtrace::init_with(
        &config,
        Scripted::new(vec![(Some("src/main.rs"), 3, Some("main"))]),
    )
    .unwrap();
    crashtrace::report(libc::SIGTERM);
    crashtrace::deinit();

    let report = fs::read_to_string(&path).unwrap();
    assert!(report.contains("SIGNAL:     SIGTERM\n"));
    assert_eq!(frame_lines(&report), ["#0:  main  at  src/main.rs:3"]);
}

#[test]
fn lifecycle() {
    let _serial = SERIAL.lock();
    assert!(!crashtrace::is_initialized());
    crashtrace::deinit();

    crashtrace::init_with(&Config::default(), Scripted::new(Vec::new())).unwrap();
    assert!(crashtrace::is_initialized());
    assert_eq!(
        crashtrace::init_with(&Config::default(), Scripted::new(Vec::new())),
        Err(InitError::AlreadyInitialized)
    );

    crashtrace::deinit();
    assert!(!crashtrace::is_initialized());
    crashtrace::deinit();

    crashtrace::init(16).unwrap();
    crashtrace::deinit();
}
