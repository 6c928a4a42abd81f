use std::{
    collections::HashSet,
    env, fs, io,
    path::{Path, PathBuf},
    rc::Rc,
};

use tracing::{debug, error, trace};

use crate::{
    daemon::{DaemonHandle, GuestDaemonJob, JobKind, LaunchSpec, ProcessLauncher, WorkerLauncher},
    diagnostics::{CodeLocation, Diagnostic, DiagnosticKind, DitError, FileFailure, Result},
    environment::{BodySource, Container, ContainerId, ContainerKind, Heap},
    evaluator::{Evaluator, Signal},
    lexer::SourceView,
    object::{from_json, FuncLang, Param},
    preprocessor::{self, GuestMarkers},
    stdlib,
    value::{format_number, Declared, TypeSpec, Value},
};

/// Host configuration for one interpreter.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Generated guest files and worker drivers are written here.
    pub tmp_dir: PathBuf,
    /// Display path of the main dit, used in tracebacks and for relative imports.
    pub main_path: String,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            tmp_dir: env::temp_dir().join("dit"),
            main_path: "<main>".into(),
        }
    }
}

pub struct Interpreter {
    pub(crate) heap: Heap,
    context: ExecutionContext,
    prelude: ContainerId,
    main: ContainerId,
    launcher: Option<Box<dyn WorkerLauncher>>,
    daemon: Option<DaemonHandle>,
    /// Guest file names already claimed by a function.
    guest_files: HashSet<String>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_context(ExecutionContext::default())
    }

    pub fn with_context(context: ExecutionContext) -> Self {
        let mut heap = Heap::new();
        let prelude = heap.alloc(Container::new(
            Some("prelude".into()),
            ContainerKind::Prelude,
            None,
        ));
        stdlib::install(&mut heap, prelude);
        let main = heap.alloc(Container::new(
            Some(context.main_path.clone()),
            ContainerKind::Dit,
            Some(prelude),
        ));
        Self {
            heap,
            context,
            prelude,
            main,
            launcher: None,
            daemon: None,
            guest_files: HashSet::new(),
        }
    }

    /// Replaces how guest workers are started. Takes effect before the first guest call.
    pub fn with_launcher(mut self, launcher: impl WorkerLauncher + 'static) -> Self {
        self.launcher = Some(Box::new(launcher));
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn main_dit(&self) -> ContainerId {
        self.main
    }

    /// Runs a whole dit into the main namespace.
    pub fn eval_source(&mut self, source: &str) -> Result<()> {
        self.run_main(SourceView::new(source), false).map(|_| ())
    }

    /// Runs REPL input into the main namespace and yields the value of the last
    /// expression statement, if any. The trailing `;` is optional.
    pub fn eval_line(&mut self, source: &str) -> Result<Option<Value>> {
        self.run_main(SourceView::new(source), true)
    }

    pub fn run_file(&mut self, path: &Path) -> Result<()> {
        let display = path.display().to_string();
        let source = load_source(&display)?;
        self.context.main_path = display.clone();
        self.heap.container_mut(self.main).name = Some(display);
        self.eval_source(&source)
    }

    /// Looks a name up from the main dit outward.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.heap
            .find_in_scope(self.main, name)
            .map(|slot| self.heap.value(slot).clone())
    }

    pub fn render(&self, value: &Value) -> String {
        self.heap.render(value)
    }

    /// Stops the guest daemon and its workers, if any were started.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.daemon.take() {
            Some(mut daemon) => daemon.shutdown(),
            None => Ok(()),
        }
    }

    fn run_main(&mut self, view: SourceView, fragment: bool) -> Result<Option<Value>> {
        let main = self.main;
        let path: Rc<str> = self.context.main_path.as_str().into();
        self.heap.container_mut(main).body = Some(BodySource {
            path: Rc::clone(&path),
            view: view.clone(),
            def_loc: CodeLocation::start(),
            interpreted: true,
        });
        let outcome = Evaluator::new(self, main, path, view, fragment).run()?;
        match outcome.signal {
            Signal::Normal => Ok(outcome.last_value),
            Signal::Return(value) => Ok(Some(value)),
            Signal::Throw(value) => Err(self.uncaught(&value)),
        }
    }

    fn uncaught(&self, value: &Value) -> DitError {
        DitError::from(Diagnostic::new(
            DiagnosticKind::Thrown,
            format!("Uncaught throw: {}", self.heap.render(value)),
        ))
    }

    /// Interprets a class or Lang body the first time it is needed.
    pub(crate) fn ensure_ready(&mut self, id: ContainerId) -> Result<()> {
        let body = match &mut self.heap.container_mut(id).body {
            Some(body) if !body.interpreted => {
                body.interpreted = true;
                body.clone()
            }
            _ => return Ok(()),
        };
        let tag = match self.heap.container(id).kind {
            ContainerKind::Lang => format!("lang {}", self.heap.name_of(id)),
            _ => format!("class {}", self.heap.name_of(id)),
        };
        trace!(%tag, "interpreting body");
        let outcome = Evaluator::new(self, id, Rc::clone(&body.path), body.view.clone(), false)
            .run()
            .map_err(|err| traced(err, &body.path, body.def_loc, tag))?;
        match outcome.signal {
            Signal::Throw(value) => Err(self.uncaught(&value)),
            _ => Ok(()),
        }
    }

    pub(crate) fn call_function(&mut self, func: ContainerId, args: Vec<Value>) -> Result<Value> {
        let name = self.heap.name_of(func).to_string();
        let (params, ret, lang, native) = match &self.heap.container(func).kind {
            ContainerKind::Func(data) => (data.params.clone(), data.ret, data.lang, data.native),
            _ => {
                return Err(DitError::from(Diagnostic::critical(format!(
                    "'{name}' is not a function"
                ))))
            }
        };
        self.check_arguments(&name, &params, &args)?;
        if let Some(native) = native {
            return native(self, &args);
        }

        let scope = self.heap.container(func).scope;
        let mut frame = Container::new(Some(name.clone()), ContainerKind::Frame { func }, scope);
        frame.body = self.heap.container(func).body.clone();
        let frame = self.heap.alloc(frame);
        for (param, arg) in params.iter().zip(args) {
            let slot = self.heap.declare(frame, &param.name, param.declared)?;
            self.heap.assign(slot, arg)?;
        }

        let value = match lang {
            FuncLang::Ditlang => {
                let body = self.body_of(func)?;
                let outcome = Evaluator::new(self, frame, Rc::clone(&body.path), body.view, false).run()?;
                match outcome.signal {
                    Signal::Normal => Value::Null,
                    Signal::Return(value) => value,
                    Signal::Throw(value) => return Err(self.uncaught(&value)),
                }
            }
            FuncLang::Guest(lang) => {
                let value = self.call_guest(func, frame, lang)?;
                coerce_guest(value, ret)
            }
        };
        self.check_return(value, ret)
    }

    fn check_arguments(&self, name: &str, params: &[Param], args: &[Value]) -> Result<()> {
        if args.len() < params.len() {
            let missing: Vec<&str> = params[args.len()..]
                .iter()
                .map(|param| param.name.as_str())
                .collect();
            return Err(DitError::from(Diagnostic::syntax(format!(
                "{name} missing {} required arguments: {}",
                missing.len(),
                missing.join(", ")
            ))));
        }
        if args.len() > params.len() {
            return Err(DitError::from(Diagnostic::syntax(format!(
                "{name} takes {} arguments but {} were given",
                params.len(),
                args.len()
            ))));
        }
        for (param, arg) in params.iter().zip(args) {
            if let Some(mismatch) = self.heap.check_value(arg, &param.declared) {
                return Err(DitError::from(Diagnostic::type_mismatch(format!(
                    "Expected '{}' for parameter '{}', got '{}'",
                    mismatch.expected(),
                    param.name,
                    mismatch.actual()
                ))));
            }
        }
        Ok(())
    }

    fn check_return(&self, value: Value, ret: Option<Declared>) -> Result<Value> {
        match ret {
            None if value.is_null() => Ok(Value::Null),
            None => Err(DitError::from(Diagnostic::type_mismatch(format!(
                "Expected 'void' for return, got '{}'",
                self.heap.value_label(&value)
            )))),
            Some(declared) => match self.heap.check_value(&value, &declared) {
                Some(mismatch) => Err(DitError::from(Diagnostic::type_mismatch(format!(
                    "Expected '{}' for return, got '{}'",
                    mismatch.expected(),
                    mismatch.actual()
                )))),
                None => Ok(value),
            },
        }
    }

    fn body_of(&self, id: ContainerId) -> Result<BodySource> {
        self.heap.container(id).body.clone().ok_or_else(|| {
            DitError::from(Diagnostic::critical(format!(
                "'{}' has no body",
                self.heap.name_of(id)
            )))
        })
    }

    fn call_guest(&mut self, func: ContainerId, frame: ContainerId, lang: ContainerId) -> Result<Value> {
        let lang_name = self.heap.name_of(lang).to_string();
        let func_name = self.heap.name_of(func).to_string();
        let func_path = self.guest_file(func, lang)?;
        let spec = LaunchSpec {
            lang_name: lang_name.clone(),
            executable: self.heap.lang_prop(lang, "executable_path")?,
            extension: self.heap.lang_prop(lang, "file_extension")?,
            driver_source: self.heap.lang_prop(lang, "guest_daemon")?,
        };
        debug!(lang = %lang_name, func = %func_name, path = %func_path.display(), "calling guest function");

        let mut job = GuestDaemonJob::call(&lang_name, &func_name, &func_path);
        loop {
            let finished = self.daemon()?.run_job(job, &spec)?;
            match finished.kind {
                JobKind::FinishFunc => return Ok(from_json(&finished.result)),
                JobKind::ExeDitlang => {
                    let code = match &finished.result {
                        serde_json::Value::String(code) => code.clone(),
                        other => other.to_string(),
                    };
                    trace!(%code, "exe_ditlang callback");
                    let value = self.eval_fragment(frame, &code)?;
                    let reply = self.heap.to_json(&value);
                    job = finished.callback(reply);
                }
                other => {
                    return Err(DitError::from(Diagnostic::critical(format!(
                        "Guest job for '{func_name}' ended as {other:?}"
                    ))))
                }
            }
        }
    }

    fn daemon(&mut self) -> Result<&mut DaemonHandle> {
        if self.daemon.is_none() {
            let launcher = self
                .launcher
                .take()
                .unwrap_or_else(|| Box::new(ProcessLauncher));
            self.daemon = Some(DaemonHandle::spawn(launcher, self.context.tmp_dir.clone())?);
        }
        self.daemon
            .as_mut()
            .ok_or_else(|| DitError::from(Diagnostic::critical("Guest daemon is not running")))
    }

    /// Preprocesses a guest body into its own file, once per function.
    fn guest_file(&mut self, func: ContainerId, lang: ContainerId) -> Result<PathBuf> {
        if let ContainerKind::Func(data) = &self.heap.container(func).kind {
            if let Some(path) = &data.guest_path {
                return Ok(path.clone());
            }
        }
        let body = self.body_of(func)?;
        let markers = GuestMarkers::from_lang(&self.heap, lang)?;
        let source = preprocessor::preprocess(&body.view, &markers).map_err(|err| {
            let loc = err
                .diagnostic()
                .and_then(|diag| diag.pending_loc)
                .unwrap_or(body.def_loc);
            let code = body.view.line_text(loc).to_string();
            err.annotate(&body.path, loc, code)
        })?;
        let lang_name = self.heap.name_of(lang).to_string();
        let base = guest_func_name(self.heap.name_of(func), func);
        let mut stem = base.clone();
        let mut file_name = preprocessor::guest_file_name(&lang_name, &stem, &markers.extension);
        // same-named functions in different bodies each get their own file
        let mut suffix = 1;
        while self.guest_files.contains(&file_name) {
            suffix += 1;
            stem = format!("{base}_{suffix}");
            file_name = preprocessor::guest_file_name(&lang_name, &stem, &markers.extension);
        }
        self.guest_files.insert(file_name.clone());
        let path = preprocessor::write_guest_file(&self.context.tmp_dir, &file_name, &source)?;
        debug!(path = %path.display(), "wrote guest file");
        if let ContainerKind::Func(data) = &mut self.heap.container_mut(func).kind {
            data.guest_path = Some(path.clone());
        }
        Ok(path)
    }

    /// Runs an `exe_ditlang` fragment in the calling function's frame.
    fn eval_fragment(&mut self, frame: ContainerId, code: &str) -> Result<Value> {
        let path: Rc<str> = match &self.heap.container(frame).body {
            Some(body) => format!("{} (exe_ditlang)", body.path).into(),
            None => "exe_ditlang".into(),
        };
        let outcome = Evaluator::new(self, frame, path, SourceView::new(code), true).run()?;
        match outcome.signal {
            Signal::Return(value) => Ok(value),
            Signal::Throw(value) => Err(self.uncaught(&value)),
            Signal::Normal => Ok(outcome.last_value.unwrap_or_default()),
        }
    }

    /// Loads and runs another dit. Relative paths resolve against the importer.
    pub(crate) fn import_dit(&mut self, target: &str, importer: &str) -> Result<ContainerId> {
        let resolved = resolve_import(target, importer);
        debug!(path = %resolved, "importing dit");
        let source = load_source(&resolved)?;
        let path: Rc<str> = resolved.into();
        let view = SourceView::new(source);
        let dit = self.heap.alloc(
            Container::new(Some(path.to_string()), ContainerKind::Dit, Some(self.prelude)).with_body(
                BodySource {
                    path: Rc::clone(&path),
                    view: view.clone(),
                    def_loc: CodeLocation::start(),
                    interpreted: true,
                },
            ),
        );
        let outcome = Evaluator::new(self, dit, path, view, false).run()?;
        if let Signal::Throw(value) = outcome.signal {
            return Err(self.uncaught(&value));
        }
        Ok(dit)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "guest daemon shutdown failed");
        }
    }
}

fn traced(err: DitError, path: &str, loc: CodeLocation, tag: String) -> DitError {
    if err.diagnostic().is_some_and(Diagnostic::is_annotated) {
        err.traced(path, loc, tag)
    } else {
        err
    }
}

fn guest_func_name(name: &str, id: ContainerId) -> String {
    match name {
        "anonymous" => format!("anonymous{}", id.0),
        _ => name.to_string(),
    }
}

/// Guest results arrive as plain JSON; bend them toward the declared return type.
fn coerce_guest(value: Value, ret: Option<Declared>) -> Value {
    let Some(Declared { ty, list: false }) = ret else {
        return value;
    };
    match (ty, value) {
        (TypeSpec::Num, Value::Str(text)) => match text.trim().parse::<f64>() {
            Ok(number) => Value::Num(number),
            Err(_) => Value::Str(text),
        },
        (TypeSpec::Str, Value::Num(number)) => Value::Str(format_number(number)),
        (TypeSpec::Str, Value::Bool(flag)) => Value::Str(flag.to_string()),
        (TypeSpec::Bool, Value::Str(text)) => match text.as_str() {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            _ => Value::Str(text),
        },
        (_, value) => value,
    }
}

fn is_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

fn resolve_import(target: &str, importer: &str) -> String {
    if is_url(target) || Path::new(target).is_absolute() {
        return target.to_string();
    }
    if is_url(importer) {
        return match importer.rfind('/') {
            Some(end) => format!("{}/{target}", &importer[..end]),
            None => target.to_string(),
        };
    }
    match Path::new(importer).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(target).display().to_string(),
        _ => target.to_string(),
    }
}

/// Reads a dit from disk or over HTTP(S).
pub fn load_source(path: &str) -> Result<String> {
    if is_url(path) {
        let transport = |err: String| {
            DitError::from(Diagnostic::new(
                DiagnosticKind::File(FileFailure::Transport),
                format!("Import failed, {err}"),
            ))
        };
        return ureq::get(path)
            .call()
            .map_err(|err| transport(err.to_string()))?
            .into_string()
            .map_err(|err| transport(err.to_string()));
    }
    let metadata = fs::metadata(path).map_err(|err| file_error(path, &err))?;
    if !metadata.is_file() {
        return Err(DitError::from(Diagnostic::new(
            DiagnosticKind::File(FileFailure::NotAFile),
            format!("Import failed, not a file: '{path}'"),
        )));
    }
    fs::read_to_string(path).map_err(|err| file_error(path, &err))
}

fn file_error(path: &str, err: &io::Error) -> DitError {
    let (failure, message) = match err.kind() {
        io::ErrorKind::NotFound => (FileFailure::NotFound, format!("Import failed, file not found: '{path}'")),
        io::ErrorKind::PermissionDenied => (
            FileFailure::PermissionDenied,
            format!("Import failed, permission denied: '{path}'"),
        ),
        _ => (FileFailure::Transport, format!("Import failed, {err}: '{path}'")),
    };
    DitError::from(Diagnostic::new(DiagnosticKind::File(failure), message))
}
