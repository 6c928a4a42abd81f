use std::rc::Rc;

use indexmap::IndexMap;

use crate::{
    diagnostics::{CodeLocation, Diagnostic, DitError, Result},
    environment::{BodySource, Container, ContainerId, ContainerKind, SlotId},
    grammar::Grammar,
    lexer::{Lexer, Payload, SourceView, Token},
    object::{ClassData, FuncData, FuncLang, Member, Param},
    runtime::Interpreter,
    value::{Declared, JsonRef, TypeSpec, Value},
};

/// How a statement finished. Returns and throws travel here, never through errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Normal,
    Return(Value),
    Throw(Value),
}

pub(crate) struct Outcome {
    pub signal: Signal,
    pub last_value: Option<Value>,
}

/// Something an expression path can be read from or written to.
enum Operand {
    Value(Value),
    Slot(SlotId),
    Member(Member),
    Json { root: JsonRoot, keys: Vec<String> },
}

enum JsonRoot {
    /// A JSON or Thing slot, possibly still null.
    Slot(SlotId),
    Map(JsonRef),
}

/// Tokenizes and executes one body, a statement at a time.
pub(crate) struct Evaluator<'a> {
    interp: &'a mut Interpreter,
    body: ContainerId,
    path: Rc<str>,
    lexer: Lexer,
    prev: Token,
    curr: Token,
    next: Token,
    /// Callback and REPL input: the last `;` is optional and the last value is kept.
    fragment: bool,
    last_value: Option<Value>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(
        interp: &'a mut Interpreter,
        body: ContainerId,
        path: Rc<str>,
        view: SourceView,
        fragment: bool,
    ) -> Self {
        let start = Token::eof(view.start_loc());
        Self {
            interp,
            body,
            path,
            lexer: Lexer::new(view),
            prev: start.clone(),
            curr: start.clone(),
            next: start,
            fragment,
            last_value: None,
        }
    }

    pub(crate) fn run(mut self) -> Result<Outcome> {
        match self.run_statements() {
            Ok(signal) => Ok(Outcome {
                signal,
                last_value: self.last_value.take(),
            }),
            Err(err) => Err(self.annotate(err)),
        }
    }

    fn run_statements(&mut self) -> Result<Signal> {
        loop {
            self.advance(true)?;
            match self.next.grammar {
                Grammar::Eof => return Ok(Signal::Normal),
                Grammar::Semi => continue,
                _ => {}
            }
            let signal = self.statement()?;
            if signal != Signal::Normal {
                return Ok(signal);
            }
        }
    }

    fn annotate(&self, err: DitError) -> DitError {
        let pending = match err.diagnostic() {
            Some(diag) if !diag.is_annotated() => Some(diag.pending_loc),
            _ => None,
        };
        let Some(pending) = pending else {
            return err;
        };
        let loc = pending.unwrap_or(self.curr.loc);
        let code = self.lexer.feed().line_text(loc).to_string();
        err.annotate(&self.path, loc, code)
    }

    /// Adds a trace frame to errors that already carry an origin from a nested body.
    fn frame(&self, err: DitError, loc: CodeLocation, tag: impl Into<String>) -> DitError {
        if err.diagnostic().is_some_and(Diagnostic::is_annotated) {
            err.traced(&self.path, loc, tag)
        } else {
            err
        }
    }

    fn advance(&mut self, resolve_names: bool) -> Result<()> {
        let token = {
            let resolver = self.interp.heap.resolver(self.body);
            self.lexer.next_token(&resolver, resolve_names)?
        };
        self.prev = std::mem::replace(&mut self.curr, std::mem::replace(&mut self.next, token));
        Ok(())
    }

    fn syntax_at(&self, message: impl Into<String>, loc: CodeLocation) -> DitError {
        DitError::from(Diagnostic::syntax(message).at(loc))
    }

    fn expect_terminal(&self) -> Result<()> {
        match self.next.grammar {
            Grammar::Semi => Ok(()),
            Grammar::Eof if self.fragment => Ok(()),
            _ => Err(self.syntax_at("Expected ';'", self.curr.end_loc())),
        }
    }

    fn undeclared(&self, token: &Token) -> DitError {
        let word = token.word().unwrap_or_default();
        self.syntax_at(format!("Undeclared variable '{word}'"), token.loc)
    }

    fn name_of_next(&self) -> Option<String> {
        match self.next.grammar {
            Grammar::Word | Grammar::NewName | Grammar::Value(_) => {
                self.next.word().map(str::to_string)
            }
            _ => None,
        }
    }

    fn can_return(&self) -> bool {
        self.fragment
            || matches!(
                self.interp.heap.container(self.body).kind,
                ContainerKind::Frame { .. }
            )
    }

    // statements

    fn statement(&mut self) -> Result<Signal> {
        match self.next.grammar {
            Grammar::Primitive(_) | Grammar::ListOf => {
                let declared = self.parse_type()?;
                self.declaration_rest(declared)?;
            }
            Grammar::Value(_) => self.value_statement()?,
            Grammar::Class => {
                self.class_definition(true)?;
            }
            Grammar::Func => {
                self.func_definition(true)?;
            }
            Grammar::Lang => self.lang_definition()?,
            Grammar::Import => self.import_statement()?,
            Grammar::Return => return self.return_statement(),
            Grammar::Throw => return self.throw_statement(),
            Grammar::NewName => return Err(self.undeclared(&self.next)),
            grammar if self.fragment && grammar.starts_expression() => {
                let value = self.expression()?;
                self.last_value = Some(value);
                self.expect_terminal()?;
            }
            Grammar::TriangleLeft
            | Grammar::TriangleRight
            | Grammar::CircleLeft
            | Grammar::CircleRight => {
                return Err(self.syntax_at(
                    format!(
                        "'{}' is only allowed inside guest function bodies",
                        self.next.grammar.text()
                    ),
                    self.next.loc,
                ));
            }
            _ => return Err(self.syntax_at("Illegal start of statement", self.next.loc)),
        }
        Ok(Signal::Normal)
    }

    /// Consumes `[listOf] Type`, leaving `next` on whatever follows.
    fn parse_type(&mut self) -> Result<Declared> {
        let list = self.next.grammar == Grammar::ListOf;
        if list {
            self.advance(true)?;
        }
        match self.next.grammar {
            Grammar::Primitive(primitive) => {
                self.advance(true)?;
                Ok(Declared {
                    ty: primitive.into(),
                    list,
                })
            }
            Grammar::Value(_) => {
                let loc = self.next.loc;
                let operand = self.operand()?;
                match self.read(&operand)? {
                    Value::Class(class) => Ok(Declared {
                        ty: TypeSpec::Of(class),
                        list,
                    }),
                    other => Err(self.syntax_at(
                        format!("Expected a type, got '{}'", other.type_name()),
                        loc,
                    )),
                }
            }
            Grammar::NewName => Err(self.undeclared(&self.next)),
            _ => Err(self.syntax_at("Expected a type", self.next.loc)),
        }
    }

    /// `name [= expr];` after a type, or `body.name [= expr];` for dotted targets.
    fn declaration_rest(&mut self, declared: Declared) -> Result<()> {
        let loc = self.next.loc;
        let Some(first) = self.name_of_next() else {
            return Err(self.syntax_at("Expected a name to declare", self.next.loc));
        };
        let first_slot = self.next.slot();
        self.advance(true)?;
        let (owner, name) = if self.next.grammar == Grammar::Dot {
            let slot = first_slot.ok_or_else(|| {
                self.syntax_at(format!("Undeclared variable '{first}'"), loc)
            })?;
            let mut base = self.interp.heap.value(slot).clone();
            loop {
                self.advance(false)?;
                if self.next.grammar != Grammar::Word {
                    return Err(self.syntax_at("Expected a name after '.'", self.next.loc));
                }
                self.advance(true)?;
                let word = self.curr.word().unwrap_or_default().to_string();
                if self.next.grammar != Grammar::Dot {
                    let owner = match &base {
                        Value::Dit(id) | Value::Lang(id) | Value::Class(id) | Value::Func(id) => *id,
                        Value::Instance(id) => *id,
                        other => {
                            return Err(self.syntax_at(
                                format!("Cannot declare '{word}' inside {}", other.type_name()),
                                self.curr.loc,
                            ))
                        }
                    };
                    break (owner, word);
                }
                let operand = self.container_member(&base, None, &word)?;
                base = self.read(&operand)?;
            }
        } else {
            (self.body, first)
        };
        let slot = self
            .interp
            .heap
            .declare(owner, &name, declared)
            .map_err(|diag| DitError::from(diag.at(loc)))?;
        if self.next.grammar == Grammar::Equals {
            self.advance(true)?;
            let value = self.expression()?;
            self.interp.heap.assign(slot, value)?;
        }
        self.expect_terminal()
    }

    fn value_statement(&mut self) -> Result<()> {
        let operand = self.operand()?;
        if matches!(self.next.grammar, Grammar::NewName | Grammar::Value(_)) {
            if let Value::Class(class) = self.read(&operand)? {
                return self.declaration_rest(Declared::scalar(TypeSpec::Of(class)));
            }
        }
        if self.next.grammar == Grammar::Equals {
            self.advance(true)?;
            let value = self.expression()?;
            self.store(operand, value)?;
            return self.expect_terminal();
        }
        let value = self.read(&operand)?;
        let value = self.continue_expression(value)?;
        self.last_value = Some(value);
        self.expect_terminal()
    }

    fn class_definition(&mut self, statement: bool) -> Result<Value> {
        let def_loc = self.next.loc;
        self.advance(false)?;
        let name = if self.next.grammar == Grammar::Word {
            let word = self.next.word().unwrap_or_default().to_string();
            self.advance(true)?;
            Some(word)
        } else {
            None
        };
        if statement {
            self.check_new_name(name.as_deref(), "class", def_loc)?;
        }
        let mut parents = Vec::new();
        if self.next.grammar == Grammar::Extends {
            loop {
                self.advance(true)?;
                let loc = self.next.loc;
                match self.next.grammar {
                    Grammar::Value(_) => {}
                    Grammar::NewName => return Err(self.undeclared(&self.next)),
                    _ => return Err(self.syntax_at("Expected a class to extend", loc)),
                }
                let operand = self.operand()?;
                match self.read(&operand)? {
                    Value::Class(parent) => parents.push(parent),
                    other => {
                        return Err(self.syntax_at(
                            format!("Classes can only extend classes, got '{}'", other.type_name()),
                            loc,
                        ))
                    }
                }
                if self.next.grammar != Grammar::Comma {
                    break;
                }
            }
        }
        let view = self.capture_body("class")?;
        let class = self.interp.heap.alloc(
            Container::new(
                name.clone(),
                ContainerKind::Class(ClassData::default()),
                Some(self.body),
            )
            .with_body(self.body_source(view, def_loc)),
        );
        for parent in parents {
            self.interp
                .ensure_ready(parent)
                .map_err(|err| self.frame(err, def_loc, "extends"))?;
            self.interp
                .heap
                .add_parent(class, parent)
                .map_err(|diag| DitError::from(diag.at(def_loc)))?;
        }
        if let (true, Some(name)) = (statement, name) {
            self.bind(&name, TypeSpec::Class, Value::Class(class), def_loc)?;
        }
        Ok(Value::Class(class))
    }

    fn func_definition(&mut self, statement: bool) -> Result<Value> {
        let def_loc = self.next.loc;
        self.advance(true)?;
        let lang = match self.next.grammar {
            Grammar::Ditlang => {
                self.advance(true)?;
                FuncLang::Ditlang
            }
            Grammar::Value(_) => {
                let loc = self.next.loc;
                let operand = self.operand()?;
                match self.read(&operand)? {
                    Value::Lang(lang) => FuncLang::Guest(lang),
                    other => {
                        return Err(self.syntax_at(
                            format!("Expected a Lang for func, got '{}'", other.type_name()),
                            loc,
                        ))
                    }
                }
            }
            Grammar::NewName => {
                let word = self.next.word().unwrap_or_default().to_string();
                let mut diag = Diagnostic::syntax(format!("Undeclared Lang '{word}'")).at(self.next.loc);
                if word.eq_ignore_ascii_case("javascript") {
                    diag = diag.with_note("Did you mean 'JavaScript'?");
                } else if word.eq_ignore_ascii_case("python") {
                    diag = diag.with_note("Did you mean 'Python'?");
                }
                return Err(DitError::from(diag));
            }
            _ => {
                return Err(self.syntax_at(
                    "Expected a Lang or 'Ditlang' after 'func'",
                    self.next.loc,
                ))
            }
        };
        let ret = if self.next.grammar == Grammar::Void {
            self.advance(true)?;
            None
        } else {
            Some(self.parse_type()?)
        };
        let name = match self.next.grammar {
            Grammar::ParenLeft => None,
            _ => match self.name_of_next() {
                Some(name) => {
                    self.advance(true)?;
                    Some(name)
                }
                None => return Err(self.syntax_at("Expected parameter list", self.next.loc)),
            },
        };
        if statement {
            self.check_new_name(name.as_deref(), "function", def_loc)?;
        }
        if self.next.grammar != Grammar::ParenLeft {
            return Err(self.syntax_at("Expected parameter list", self.curr.end_loc()));
        }
        let params = self.parameters()?;
        let view = self.capture_body("function")?;
        let func = self.interp.heap.alloc(
            Container::new(
                name.clone(),
                ContainerKind::Func(FuncData::new(params, ret, lang)),
                Some(self.body),
            )
            .with_body(self.body_source(view, def_loc)),
        );
        if let (true, Some(name)) = (statement, name) {
            self.bind(&name, TypeSpec::Func, Value::Func(func), def_loc)?;
        }
        Ok(Value::Func(func))
    }

    fn parameters(&mut self) -> Result<Vec<Param>> {
        self.advance(true)?;
        let mut params: Vec<Param> = Vec::new();
        loop {
            if self.next.grammar == Grammar::ParenRight {
                self.advance(true)?;
                return Ok(params);
            }
            let declared = self.parse_type()?;
            let loc = self.next.loc;
            let Some(name) = self.name_of_next() else {
                return Err(self.syntax_at("Expected a parameter name", loc));
            };
            if params.iter().any(|param| param.name == name) {
                return Err(self.syntax_at(format!("Duplicate parameter '{name}'"), loc));
            }
            self.advance(true)?;
            params.push(Param { name, declared });
            match self.next.grammar {
                Grammar::Comma => self.advance(true)?,
                Grammar::ParenRight => {}
                _ => return Err(self.syntax_at("Expected ')'", self.curr.end_loc())),
            }
        }
    }

    fn lang_definition(&mut self) -> Result<()> {
        let def_loc = self.next.loc;
        self.advance(false)?;
        if self.next.grammar != Grammar::Word {
            return Err(self.syntax_at("Expected a Lang name", self.next.loc));
        }
        let name = self.next.word().unwrap_or_default().to_string();
        self.advance(true)?;
        let view = self.capture_body("lang")?;
        let lang = self.interp.heap.alloc(
            Container::new(Some(name.clone()), ContainerKind::Lang, Some(self.body))
                .with_body(self.body_source(view, def_loc)),
        );
        self.interp
            .ensure_ready(lang)
            .map_err(|err| self.frame(err, def_loc, "lang"))?;

        let heap = &mut self.interp.heap;
        match heap.find_local(self.body, &name) {
            Some(slot) => heap
                .assign(slot, Value::Lang(lang))
                .map_err(|diag| DitError::from(diag.at(def_loc))),
            None => {
                let outer = heap
                    .find_in_scope(self.body, &name)
                    .map(|slot| heap.value(slot).clone());
                let merged = match outer {
                    Some(Value::Lang(previous)) => heap.merge_langs(previous, lang),
                    _ => lang,
                };
                self.bind(&name, TypeSpec::Lang, Value::Lang(merged), def_loc)
            }
        }
    }

    fn import_statement(&mut self) -> Result<()> {
        let def_loc = self.next.loc;
        self.advance(false)?;
        if self.next.grammar == Grammar::Word {
            let word = self.next.word().unwrap_or_default().to_string();
            let word_token = self.next.clone();
            self.advance(true)?;
            if self.next.grammar == Grammar::From {
                self.check_new_name(Some(word.as_str()), "import", def_loc)?;
                self.advance(true)?;
                let path = self.expression()?;
                let dit = self.load_import(path, def_loc)?;
                self.bind(&word, TypeSpec::Dit, Value::Dit(dit), def_loc)?;
                return self.expect_terminal();
            }
            // `import some_path_variable;`
            let slot = self
                .interp
                .heap
                .find_in_scope(self.body, &word)
                .ok_or_else(|| self.undeclared(&word_token))?;
            let operand = self.postfix(Operand::Slot(slot))?;
            let path = self.read(&operand)?;
            let path = self.continue_expression(path)?;
            let dit = self.load_import(path, def_loc)?;
            self.expose(dit, def_loc)?;
            return self.expect_terminal();
        }
        let path = self.expression()?;
        let dit = self.load_import(path, def_loc)?;
        self.expose(dit, def_loc)?;
        self.expect_terminal()
    }

    fn load_import(&mut self, path: Value, loc: CodeLocation) -> Result<ContainerId> {
        let Value::Str(target) = path else {
            return Err(self.syntax_at(
                format!(
                    "Expected a filepath string for import, got '{}'",
                    path.type_name()
                ),
                loc,
            ));
        };
        let importer = Rc::clone(&self.path);
        self.interp
            .import_dit(&target, &importer)
            .map_err(|err| self.frame(err, loc, "import"))
    }

    /// Makes every top-level name of `dit` reachable here by reference.
    fn expose(&mut self, dit: ContainerId, loc: CodeLocation) -> Result<()> {
        let names: Vec<(String, SlotId)> = self
            .interp
            .heap
            .container(dit)
            .attrs
            .iter()
            .map(|(name, slot)| (name.clone(), *slot))
            .collect();
        for (name, slot) in names {
            self.interp
                .heap
                .insert_alias(self.body, &name, slot)
                .map_err(|diag| DitError::from(diag.at(loc)))?;
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<Signal> {
        if !self.can_return() {
            return Err(self.syntax_at("'return' outside of function", self.next.loc));
        }
        self.advance(true)?;
        let value = match self.next.grammar {
            Grammar::Semi => Value::Null,
            Grammar::Eof if self.fragment => Value::Null,
            _ => self.expression()?,
        };
        self.expect_terminal()?;
        Ok(Signal::Return(value))
    }

    fn throw_statement(&mut self) -> Result<Signal> {
        self.advance(true)?;
        let value = self.expression()?;
        self.expect_terminal()?;
        Ok(Signal::Throw(value))
    }

    fn check_new_name(&self, name: Option<&str>, what: &str, loc: CodeLocation) -> Result<()> {
        match name {
            None => Err(self.syntax_at(format!("Expected a {what} name"), loc)),
            Some(name) if self.interp.heap.find_local(self.body, name).is_some() => Err(
                self.syntax_at(format!("'{name}' has already been declared"), loc),
            ),
            Some(_) => Ok(()),
        }
    }

    fn bind(&mut self, name: &str, ty: TypeSpec, value: Value, loc: CodeLocation) -> Result<()> {
        let heap = &mut self.interp.heap;
        let slot = heap
            .declare(self.body, name, Declared::scalar(ty))
            .map_err(|diag| DitError::from(diag.at(loc)))?;
        heap.assign(slot, value)?;
        Ok(())
    }

    /// With `next` on `{`, captures the raw body and leaves `next` on the closing `}`.
    fn capture_body(&mut self, what: &str) -> Result<SourceView> {
        if self.next.grammar != Grammar::BraceLeft {
            return Err(self.syntax_at(
                format!("Expected '{{' to open the {what} body"),
                self.curr.end_loc(),
            ));
        }
        let view = self.lexer.capture_braces()?;
        self.advance(true)?;
        Ok(view)
    }

    fn body_source(&self, view: SourceView, def_loc: CodeLocation) -> BodySource {
        BodySource {
            path: Rc::clone(&self.path),
            view,
            def_loc,
            interpreted: false,
        }
    }

    // expressions

    fn expression(&mut self) -> Result<Value> {
        let value = self.term()?;
        self.continue_expression(value)
    }

    fn continue_expression(&mut self, mut value: Value) -> Result<Value> {
        while self.next.grammar == Grammar::Plus {
            self.advance(true)?;
            let rhs = self.term()?;
            value = self.add(value, rhs)?;
        }
        Ok(value)
    }

    fn add(&self, lhs: Value, rhs: Value) -> Result<Value> {
        match (lhs, rhs) {
            (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
            (lhs, rhs) => Err(DitError::from(
                Diagnostic::type_mismatch(format!(
                    "Cannot add {} and {}",
                    self.interp.heap.value_label(&lhs),
                    self.interp.heap.value_label(&rhs)
                ))
                .at(self.prev.loc),
            )),
        }
    }

    fn term(&mut self) -> Result<Value> {
        match self.next.grammar {
            Grammar::QuoteDouble | Grammar::QuoteSingle => Ok(Value::Str(self.string_literal()?)),
            Grammar::Number => {
                self.advance(true)?;
                match self.curr.payload {
                    Payload::Number(number) => Ok(Value::Num(number)),
                    _ => Err(DitError::from(Diagnostic::critical("Number token without a value"))),
                }
            }
            Grammar::True | Grammar::False | Grammar::Null => {
                self.advance(true)?;
                Ok(match self.curr.grammar {
                    Grammar::True => Value::Bool(true),
                    Grammar::False => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            Grammar::BracketLeft => self.list_literal(),
            Grammar::BraceLeft => self.json_literal(),
            Grammar::Class => {
                let class = self.class_definition(false)?;
                self.anonymous_tail(class)
            }
            Grammar::Func => {
                let func = self.func_definition(false)?;
                self.anonymous_tail(func)
            }
            Grammar::Import => {
                let loc = self.next.loc;
                self.advance(true)?;
                let path = self.term()?;
                let dit = self.load_import(path, loc)?;
                let operand = self.postfix(Operand::Value(Value::Dit(dit)))?;
                self.read(&operand)
            }
            Grammar::Value(_) => {
                let operand = self.operand()?;
                self.read(&operand)
            }
            Grammar::NewName => Err(self.undeclared(&self.next)),
            _ => Err(self.syntax_at("Illegal start of expression", self.next.loc)),
        }
    }

    /// After an anonymous body, `next` sits on its `}`; step past it and allow `.x` or `()`.
    fn anonymous_tail(&mut self, value: Value) -> Result<Value> {
        self.advance(true)?;
        let operand = self.postfix(Operand::Value(value))?;
        self.read(&operand)
    }

    fn string_literal(&mut self) -> Result<String> {
        let quote = if self.next.grammar == Grammar::QuoteDouble {
            b'"'
        } else {
            b'\''
        };
        let text = self.lexer.scan_string(quote)?;
        self.advance(true)?;
        self.advance(true)?;
        Ok(text)
    }

    fn list_literal(&mut self) -> Result<Value> {
        self.advance(true)?;
        let mut items = Vec::new();
        loop {
            if self.next.grammar == Grammar::BracketRight {
                self.advance(true)?;
                return Ok(Value::list(TypeSpec::Thing, items));
            }
            items.push(self.expression()?);
            match self.next.grammar {
                Grammar::Comma => self.advance(true)?,
                Grammar::BracketRight => {}
                _ => return Err(self.syntax_at("Expected ']'", self.curr.end_loc())),
            }
        }
    }

    fn json_literal(&mut self) -> Result<Value> {
        self.advance(true)?;
        let mut entries = IndexMap::new();
        loop {
            if self.next.grammar == Grammar::BraceRight {
                self.advance(true)?;
                return Ok(Value::json(entries));
            }
            let key = match self.next.grammar {
                Grammar::QuoteDouble | Grammar::QuoteSingle => self.string_literal()?,
                _ => match self.name_of_next() {
                    Some(word) => {
                        self.advance(true)?;
                        word
                    }
                    None => return Err(self.syntax_at("Expected a JSON key", self.next.loc)),
                },
            };
            if self.next.grammar != Grammar::Colon {
                return Err(self.syntax_at("Expected ':'", self.curr.end_loc()));
            }
            self.advance(true)?;
            let value = self.expression()?;
            entries.insert(key, value);
            match self.next.grammar {
                Grammar::Comma => self.advance(true)?,
                Grammar::BraceRight => {}
                _ => return Err(self.syntax_at("Expected '}'", self.curr.end_loc())),
            }
        }
    }

    // paths

    /// Consumes a resolved name and every `.member` or `(args)` step after it.
    fn operand(&mut self) -> Result<Operand> {
        self.advance(true)?;
        let slot = self.curr.slot().ok_or_else(|| {
            DitError::from(Diagnostic::critical("Resolved token without a slot").at(self.curr.loc))
        })?;
        self.postfix(Operand::Slot(slot))
    }

    fn postfix(&mut self, mut operand: Operand) -> Result<Operand> {
        loop {
            operand = match self.next.grammar {
                Grammar::Dot => self.member(operand)?,
                Grammar::ParenLeft => Operand::Value(self.call(operand)?),
                _ => return Ok(operand),
            };
        }
    }

    fn member(&mut self, operand: Operand) -> Result<Operand> {
        self.advance(false)?;
        if self.next.grammar != Grammar::Word {
            return Err(self.syntax_at("Expected a name after '.'", self.next.loc));
        }
        self.advance(true)?;
        let name = self.curr.word().unwrap_or_default().to_string();
        match operand {
            Operand::Json { root, mut keys } => {
                keys.push(name);
                Ok(Operand::Json { root, keys })
            }
            Operand::Member(Member::Qualifier { base, class }) => {
                self.container_member(&base, Some(class), &name)
            }
            other => {
                let value = self.read(&other)?;
                match (&other, value) {
                    (_, Value::Json(map)) => Ok(Operand::Json {
                        root: JsonRoot::Map(map),
                        keys: vec![name],
                    }),
                    (Operand::Slot(slot), Value::Null) if self.grows_json(*slot) => {
                        Ok(Operand::Json {
                            root: JsonRoot::Slot(*slot),
                            keys: vec![name],
                        })
                    }
                    (_, value) => self.container_member(&value, None, &name),
                }
            }
        }
    }

    fn grows_json(&self, slot: SlotId) -> bool {
        let slot = self.interp.heap.slot(slot);
        slot.generic || slot.declared == Declared::scalar(TypeSpec::Json)
    }

    fn container_member(
        &mut self,
        base: &Value,
        qualifier: Option<ContainerId>,
        name: &str,
    ) -> Result<Operand> {
        let loc = self.curr.loc;
        let class = match base {
            Value::Class(class) => Some(*class),
            Value::Instance(instance) => self.interp.heap.class_of(*instance),
            _ => None,
        };
        if let Some(class) = qualifier.or(class) {
            self.interp
                .ensure_ready(class)
                .map_err(|err| self.frame(err, loc, "class"))?;
        }
        let member = self
            .interp
            .heap
            .member(base, qualifier, name)
            .map_err(|diag| DitError::from(diag.at(loc)))?;
        Ok(match member {
            Member::Slot(slot) => Operand::Slot(slot),
            other => Operand::Member(other),
        })
    }

    fn call(&mut self, operand: Operand) -> Result<Value> {
        let callee = self.read(&operand)?;
        let loc = self.next.loc;
        let args = self.arguments()?;
        match callee {
            Value::Func(func) => {
                let name = self.interp.heap.name_of(func).to_string();
                self.interp
                    .call_function(func, args)
                    .map_err(|err| self.frame(err, loc, name))
            }
            Value::Class(class) => {
                if !args.is_empty() {
                    return Err(self.syntax_at("Class instantiation takes no arguments", loc));
                }
                self.interp
                    .ensure_ready(class)
                    .map_err(|err| self.frame(err, loc, "class"))?;
                Ok(Value::Instance(self.interp.heap.new_instance(class)))
            }
            other => Err(self.syntax_at(
                format!("'{}' is not callable", other.type_name()),
                loc,
            )),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Value>> {
        self.advance(true)?;
        let mut args = Vec::new();
        loop {
            if self.next.grammar == Grammar::ParenRight {
                self.advance(true)?;
                return Ok(args);
            }
            args.push(self.expression()?);
            match self.next.grammar {
                Grammar::Comma => self.advance(true)?,
                Grammar::ParenRight => {}
                _ => return Err(self.syntax_at("Expected ')'", self.curr.end_loc())),
            }
        }
    }

    fn read(&self, operand: &Operand) -> Result<Value> {
        let heap = &self.interp.heap;
        match operand {
            Operand::Value(value) => Ok(value.clone()),
            Operand::Slot(slot) => Ok(heap.value(*slot).clone()),
            Operand::Member(Member::Slot(slot)) | Operand::Member(Member::Inherited { slot, .. }) => {
                Ok(heap.value(*slot).clone())
            }
            Operand::Member(Member::Qualifier { class, .. }) => Ok(Value::Class(*class)),
            Operand::Json { root, keys } => {
                let mut current = match root {
                    JsonRoot::Slot(slot) => heap.value(*slot).clone(),
                    JsonRoot::Map(map) => Value::Json(Rc::clone(map)),
                };
                for key in keys {
                    let next = match &current {
                        Value::Json(map) => map.borrow().get(key).cloned(),
                        Value::Null => {
                            return Err(self.syntax_at(
                                format!("Cannot read '{key}' of null"),
                                self.curr.loc,
                            ))
                        }
                        other => {
                            return Err(self.syntax_at(
                                format!("Cannot read '{key}' of {}", other.type_name()),
                                self.curr.loc,
                            ))
                        }
                    };
                    current = next.ok_or_else(|| {
                        self.syntax_at(format!("'{key}' is not a key of this JSON"), self.curr.loc)
                    })?;
                }
                Ok(current)
            }
        }
    }

    fn store(&mut self, operand: Operand, value: Value) -> Result<()> {
        let heap = &mut self.interp.heap;
        match operand {
            Operand::Slot(slot) | Operand::Member(Member::Slot(slot)) => {
                heap.assign(slot, value)?;
                Ok(())
            }
            Operand::Member(Member::Inherited {
                slot,
                instance,
                key,
            }) => {
                let local = heap.materialize(instance, &key, slot);
                heap.assign(local, value)?;
                Ok(())
            }
            Operand::Json { root, keys } => {
                let mut map = match root {
                    JsonRoot::Map(map) => map,
                    JsonRoot::Slot(slot) => {
                        let existing = match heap.value(slot) {
                            Value::Json(map) => Some(Rc::clone(map)),
                            _ => None,
                        };
                        match existing {
                            Some(map) => map,
                            None => {
                                let map: JsonRef = Rc::default();
                                heap.assign(slot, Value::Json(Rc::clone(&map)))?;
                                map
                            }
                        }
                    }
                };
                let Some((last, path)) = keys.split_last() else {
                    return Err(DitError::from(Diagnostic::critical("Empty JSON path")));
                };
                for key in path {
                    let existing = map.borrow().get(key).cloned();
                    map = match existing {
                        Some(Value::Json(inner)) => inner,
                        None | Some(Value::Null) => {
                            let inner: JsonRef = Rc::default();
                            map.borrow_mut()
                                .insert(key.clone(), Value::Json(Rc::clone(&inner)));
                            inner
                        }
                        Some(other) => {
                            return Err(DitError::from(Diagnostic::type_mismatch(format!(
                                "Cannot set '{key}.{last}' on {}",
                                other.type_name()
                            ))))
                        }
                    };
                }
                map.borrow_mut().insert(last.clone(), value);
                Ok(())
            }
            Operand::Value(_) | Operand::Member(Member::Qualifier { .. }) => {
                Err(self.syntax_at("Cannot assign to this expression", self.curr.loc))
            }
        }
    }
}
