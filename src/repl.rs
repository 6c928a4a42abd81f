use rustyline::{error::ReadlineError, DefaultEditor};

use crate::{
    diagnostics::{DitError, Result},
    runtime::{ExecutionContext, Interpreter},
};

pub struct Repl {
    interpreter: Interpreter,
}

impl Repl {
    pub fn new() -> Self {
        Self::with_context(ExecutionContext::default())
    }

    pub fn with_context(context: ExecutionContext) -> Self {
        Self {
            interpreter: Interpreter::with_context(context),
        }
    }

    /// Reads lines until `.exit`, EOF or Ctrl-C. Errors are printed and the session goes on.
    pub fn run(&mut self) -> Result<()> {
        let mut editor = DefaultEditor::new()
            .map_err(|err| DitError::from(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
        loop {
            match editor.readline("dit> ") {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed == ".exit" {
                        break;
                    }
                    if trimmed.is_empty() {
                        continue;
                    }
                    editor.add_history_entry(trimmed).ok();
                    match self.interpreter.eval_line(trimmed) {
                        Ok(Some(value)) if !value.is_null() => {
                            println!("{}", self.interpreter.render(&value));
                        }
                        Ok(_) => {}
                        Err(err) => eprintln!("{err}"),
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    return Err(DitError::from(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        err,
                    )));
                }
            }
        }
        self.interpreter.shutdown()
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
