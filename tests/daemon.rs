use dit::{
    daemon::{DaemonHandle, GuestDaemonJob, JobKind, LaunchSpec, WorkerLauncher, WorkerProcess},
    diagnostics::DiagnosticKind,
    runtime::{ExecutionContext, Interpreter},
    value::Value,
};
use serde_json::{json, Value as Json};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    net::TcpStream,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tempfile::tempdir;

/// One in-process guest worker speaking the daemon's line protocol.
struct Worker {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Worker {
    fn connect(port: u16, lang: &str) -> Self {
        let writer = TcpStream::connect(("127.0.0.1", port)).expect("connect to daemon");
        let reader = BufReader::new(writer.try_clone().expect("clone stream"));
        let mut worker = Self { reader, writer };
        worker.send(json!({ "type": "connect", "lang": lang }));
        worker
    }

    fn send(&mut self, message: Json) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).expect("write to daemon");
    }

    fn recv(&mut self) -> Option<Json> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(serde_json::from_str(&line).expect("daemon sends JSON lines")),
        }
    }
}

type Behavior = Arc<dyn Fn(&mut Worker) + Send + Sync>;

#[derive(Clone)]
struct ThreadLauncher {
    behavior: Behavior,
    launches: Arc<AtomicUsize>,
}

impl ThreadLauncher {
    fn new(behavior: impl Fn(&mut Worker) + Send + Sync + 'static) -> Self {
        Self {
            behavior: Arc::new(behavior),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct ThreadWorker(thread::JoinHandle<()>);

impl WorkerProcess for ThreadWorker {
    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.0.is_finished())
    }

    fn terminate(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(
        &self,
        spec: &LaunchSpec,
        port: u16,
        _tmp_dir: &Path,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let lang = spec.lang_name.clone();
        let behavior = Arc::clone(&self.behavior);
        let handle = thread::spawn(move || {
            let mut worker = Worker::connect(port, &lang);
            behavior(&mut worker);
        });
        Ok(Box::new(ThreadWorker(handle)))
    }
}

fn interpreter(dir: &Path, launcher: ThreadLauncher) -> Interpreter {
    Interpreter::with_context(ExecutionContext {
        tmp_dir: dir.to_path_buf(),
        main_path: "main.dit".into(),
    })
    .with_launcher(launcher)
}

fn answer_every_call(worker: &mut Worker, result: Json) {
    while let Some(job) = worker.recv() {
        assert_eq!(job["type"], "call_func");
        worker.send(json!({ "type": "finish_func", "result": result.clone() }));
    }
}

#[test]
fn guest_function_round_trip_returns_num() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| {
        while let Some(job) = worker.recv() {
            assert_eq!(job["type"], "call_func");
            assert_eq!(job["lang_name"], "Python");
            assert_eq!(job["func_name"], "four");
            let path = job["func_path"].as_str().expect("func_path");
            let source = fs::read_to_string(path).expect("guest file exists");
            assert!(source.starts_with("def reserved_name(exe_ditlang): return 2+2;"));
            worker.send(json!({ "type": "heart" }));
            worker.send(json!({ "type": "finish_func", "result": 4 }));
        }
    });
    let launches = Arc::clone(&launcher.launches);
    let mut interp = interpreter(dir.path(), launcher);
    interp
        .eval_source(
            r#"
            func Python Num four() { return 2+2; }
            Num first = four();
            Num second = four();
            "#,
        )
        .expect("guest calls succeed");
    assert_eq!(interp.get("first"), Some(Value::Num(4.0)));
    assert_eq!(interp.get("second"), Some(Value::Num(4.0)));
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    assert!(dir.path().join("Python_func_four.py").exists());
    interp.shutdown().expect("clean shutdown");
}

#[test]
fn string_results_are_coerced_to_declared_num() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| answer_every_call(worker, json!("4")));
    let mut interp = interpreter(dir.path(), launcher);
    interp
        .eval_source("func Python Num four() { return str(2+2) } Num n = four();")
        .expect("guest call succeeds");
    assert_eq!(interp.get("n"), Some(Value::Num(4.0)));
}

#[test]
fn exe_ditlang_callbacks_run_in_the_call_frame() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| {
        while let Some(job) = worker.recv() {
            assert_eq!(job["type"], "call_func");
            worker.send(json!({ "type": "exe_ditlang", "result": "a + offset" }));
            let reply = worker.recv().expect("callback reply");
            assert_eq!(reply["type"], "ditlang_callback");
            let value = reply["result"].as_f64().expect("numeric callback result");
            worker.send(json!({ "type": "finish_func", "result": value + 1.0 }));
        }
    });
    let mut interp = interpreter(dir.path(), launcher);
    interp
        .eval_source(
            r#"
            Num offset = 10;
            func JavaScript Num bump(Num a) { return <|a + offset|> + 1; }
            Num out = bump(5);
            "#,
        )
        .expect("guest call with callback succeeds");
    assert_eq!(interp.get("out"), Some(Value::Num(16.0)));
    let guest = fs::read_to_string(dir.path().join("JavaScript_func_bump.js")).expect("guest file");
    assert!(guest.contains("(await exe_ditlang(`a + offset`))"), "{guest}");
}

#[test]
fn guest_crash_becomes_code_error() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| {
        while worker.recv().is_some() {
            worker.send(json!({
                "type": "crash",
                "result": "Traceback (most recent call last):\nZeroDivisionError: division by zero\n"
            }));
        }
    });
    let mut interp = interpreter(dir.path(), launcher);
    let err = interp
        .eval_source("func Python Num bad() { return 1/0 } Num n = bad();")
        .expect_err("crash should surface");
    assert_eq!(err.kind(), Some(DiagnosticKind::Code));
    let message = &err.diagnostic().expect("diagnostic").message;
    assert!(message.starts_with("Guest function 'bad' crashed:"), "{message}");
    assert!(message.contains("ZeroDivisionError"), "{message}");
}

#[test]
fn worker_disconnect_mid_call_is_a_crash() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| {
        worker.recv();
    });
    let launches = Arc::clone(&launcher.launches);
    let mut interp = interpreter(dir.path(), launcher);
    let err = interp
        .eval_source("func Python void gone() { pass } gone();")
        .expect_err("disconnect should surface");
    assert_eq!(err.kind(), Some(DiagnosticKind::Code));
    assert!(err.to_string().contains("disconnected"), "{err}");
    assert_eq!(launches.load(Ordering::SeqCst), 2);
}

#[test]
fn exited_worker_is_relaunched_for_the_next_call() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| {
        if let Some(job) = worker.recv() {
            assert_eq!(job["type"], "call_func");
            worker.send(json!({ "type": "finish_func", "result": 1 }));
        }
    });
    let launches = Arc::clone(&launcher.launches);
    let mut interp = interpreter(dir.path(), launcher);
    interp
        .eval_source(
            r#"
            func Python Num one() { return 1 }
            Num first = one();
            Num second = one();
            Num third = one();
            "#,
        )
        .expect("each call reaches a live worker");
    assert_eq!(interp.get("first"), Some(Value::Num(1.0)));
    assert_eq!(interp.get("second"), Some(Value::Num(1.0)));
    assert_eq!(interp.get("third"), Some(Value::Num(1.0)));
    assert_eq!(launches.load(Ordering::SeqCst), 3);
}

struct NeverConnects;

impl WorkerLauncher for NeverConnects {
    fn launch(
        &self,
        _spec: &LaunchSpec,
        _port: u16,
        _tmp_dir: &Path,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        Ok(Box::new(ThreadWorker(thread::spawn(|| {}))))
    }
}

#[test]
fn worker_dying_before_connect_is_a_code_error() {
    let dir = tempdir().expect("create temp dir");
    let mut interp = Interpreter::with_context(ExecutionContext {
        tmp_dir: dir.path().to_path_buf(),
        main_path: "main.dit".into(),
    })
    .with_launcher(NeverConnects);
    let err = interp
        .eval_source("func Python void f() { pass } f();")
        .expect_err("a dead worker cannot answer");
    assert_eq!(err.kind(), Some(DiagnosticKind::Code));
    assert!(err.to_string().contains("exited before it connected"), "{err}");
}

#[test]
fn same_named_guest_functions_keep_their_own_bodies() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| {
        while let Some(job) = worker.recv() {
            let path = job["func_path"].as_str().expect("func_path");
            let source = fs::read_to_string(path).expect("guest file exists");
            worker.send(json!({ "type": "finish_func", "result": source }));
        }
    });
    let mut interp = interpreter(dir.path(), launcher);
    interp
        .eval_source(
            r#"
            class A { func Python Str f() { return "from A" } }
            class B { func Python Str f() { return "from B" } }
            Str first = A.f();
            Str second = B.f();
            Str third = A.f();
            "#,
        )
        .expect("guest calls succeed");
    let body = |name: &str| match interp.get(name) {
        Some(Value::Str(text)) => text,
        other => panic!("expected Str for '{name}', found {other:?}"),
    };
    assert!(body("first").contains("from A"), "{}", body("first"));
    assert!(body("second").contains("from B"), "{}", body("second"));
    assert!(body("third").contains("from A"), "{}", body("third"));
    assert!(dir.path().join("Python_func_f.py").exists());
    assert!(dir.path().join("Python_func_f_2.py").exists());
}

#[test]
fn missing_lang_property_is_reported_before_launch() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| answer_every_call(worker, Json::Null));
    let launches = Arc::clone(&launcher.launches);
    let mut interp = interpreter(dir.path(), launcher);
    let err = interp
        .eval_source(
            r#"
            lang Bare { Str file_extension = "txt"; }
            func Bare void f() { nothing }
            f();
            "#,
        )
        .expect_err("missing executable_path");
    assert_eq!(err.kind(), Some(DiagnosticKind::MissingProp));
    assert_eq!(
        err.diagnostic().map(|diag| diag.message.as_str()),
        Some("Lang 'Bare' is missing required property 'executable_path'")
    );
    assert_eq!(launches.load(Ordering::SeqCst), 0);
}

#[test]
fn daemon_handle_runs_a_job_directly() {
    let dir = tempdir().expect("create temp dir");
    let launcher = ThreadLauncher::new(|worker| answer_every_call(worker, json!({ "ok": true })));
    let mut daemon =
        DaemonHandle::spawn(Box::new(launcher), dir.path().to_path_buf()).expect("daemon starts");
    assert_ne!(daemon.port(), 0);
    let spec = LaunchSpec {
        lang_name: "Fake".into(),
        executable: "fake".into(),
        extension: "fk".into(),
        driver_source: String::new(),
    };
    let job = GuestDaemonJob::call("Fake", "direct", &dir.path().join("direct.fk"));
    let finished = daemon.run_job(job, &spec).expect("job finishes");
    assert_eq!(finished.kind, JobKind::FinishFunc);
    assert_eq!(finished.result, json!({ "ok": true }));
    assert!(!finished.active);
    daemon.shutdown().expect("clean shutdown");
}
