use dit::{
    diagnostics::{DiagnosticKind, DitError, FileFailure},
    runtime::Interpreter,
    value::Value,
};
use std::{fs, path::Path};
use tempfile::tempdir;

fn run(source: &str) -> Interpreter {
    let mut interpreter = Interpreter::new();
    interpreter
        .eval_source(source)
        .expect("evaluation should succeed");
    interpreter
}

fn eval_error(source: &str) -> DitError {
    let mut interpreter = Interpreter::new();
    match interpreter.eval_source(source) {
        Ok(()) => panic!("expected an error from {source:?}"),
        Err(err) => err,
    }
}

fn message(err: &DitError) -> String {
    err.diagnostic()
        .map(|diag| diag.message.clone())
        .unwrap_or_else(|| err.to_string())
}

fn get(interpreter: &Interpreter, name: &str) -> Value {
    interpreter
        .get(name)
        .unwrap_or_else(|| panic!("'{name}' should be declared"))
}

fn expect_num(value: &Value) -> f64 {
    match value {
        Value::Num(number) => *number,
        other => panic!("expected Num, found {}", other.type_name()),
    }
}

fn expect_str(value: &Value) -> String {
    match value {
        Value::Str(text) => text.clone(),
        other => panic!("expected Str, found {}", other.type_name()),
    }
}

fn path_literal(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[test]
fn declares_then_assigns_a_string() {
    let interpreter = run(r#"Str greeting; greeting = "hi";"#);
    assert_eq!(expect_str(&get(&interpreter, "greeting")), "hi");
}

#[test]
fn declaration_without_value_is_null() {
    let interpreter = run("Num count; listOf Str names; JSON data;");
    assert!(get(&interpreter, "count").is_null());
    assert!(get(&interpreter, "names").is_null());
    assert!(get(&interpreter, "data").is_null());
}

#[test]
fn appending_wrong_type_to_typed_list_fails() {
    let err = eval_error(r#"listOf Num pair = [1, 2]; append(pair, "three");"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
    let text = message(&err);
    assert!(text.contains("Num"), "{text}");
    assert!(text.contains("Str"), "{text}");
}

#[test]
fn append_and_len_grow_a_list() {
    let interpreter = run("listOf Num nums = [1]; append(nums, 2); Num size = len(nums);");
    assert_eq!(expect_num(&get(&interpreter, "size")), 2.0);
}

#[test]
fn typing_a_shared_list_leaves_the_untyped_owner_alone() {
    let interpreter = run(
        r#"
        listOf Thing t = [1];
        listOf Num n = t;
        append(t, "x");
        Num tl = len(t);
        Num nl = len(n);
        "#,
    );
    assert_eq!(expect_num(&get(&interpreter, "tl")), 2.0);
    assert_eq!(expect_num(&get(&interpreter, "nl")), 1.0);

    let err = eval_error(r#"listOf Thing t = [1]; listOf Num n = t; append(n, "y");"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
}

#[test]
fn reading_a_name_twice_is_stable() {
    let mut interpreter = run(
        r#"
        Num x = 5;
        listOf Num xs = [1, 2];
        Num a = x;
        Num b = x;
        listOf Num first = xs;
        listOf Num second = xs;
        "#,
    );
    assert_eq!(get(&interpreter, "a"), get(&interpreter, "b"));
    assert_eq!(expect_num(&get(&interpreter, "x")), 5.0);
    assert_eq!(get(&interpreter, "first"), get(&interpreter, "second"));
    assert_eq!(get(&interpreter, "xs"), get(&interpreter, "first"));

    let once = interpreter.eval_line("x").expect("read x");
    let twice = interpreter.eval_line("x").expect("read x again");
    assert_eq!(once, Some(Value::Num(5.0)));
    assert_eq!(once, twice);
    let size = interpreter.eval_line("len(xs)").expect("len");
    assert_eq!(size, Some(Value::Num(2.0)));
}

#[test]
fn list_literal_elements_are_checked_on_assignment() {
    let err = eval_error(r#"listOf Num nums = [1, "two"];"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
    assert_eq!(message(&err), "List of type 'Num' contained 'Str'");
}

#[test]
fn nested_lists_check_their_leaves() {
    let interpreter = run("listOf Num grid = [[1, 2], [3], null];");
    assert!(matches!(get(&interpreter, "grid"), Value::List(_)));

    let err = eval_error(r#"listOf Num grid = [[1, "x"]];"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
}

#[test]
fn scalar_mismatch_names_both_types() {
    let err = eval_error(r#"Num x = "a";"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
    assert_eq!(message(&err), "Cannot assign Str to Num");
}

#[test]
fn thing_slot_accepts_any_variant() {
    let interpreter = run(r#"Thing t = 1; t = "s"; t = [1, "mixed"];"#);
    assert!(matches!(get(&interpreter, "t"), Value::List(_)));
}

#[test]
fn inherited_attribute_reads_through_instance() {
    let interpreter = run(
        r#"
        class A { Str name; }
        class B extends A {}
        B b = B();
        Str seen = "unset";
        seen = b.name;
        "#,
    );
    assert!(get(&interpreter, "seen").is_null());
}

#[test]
fn instance_writes_do_not_touch_the_class() {
    let interpreter = run(
        r#"
        class P { Num n = 1; }
        P first = P();
        P second = P();
        first.n = 5;
        Num a = first.n;
        Num b = second.n;
        Num c = P.n;
        "#,
    );
    assert_eq!(expect_num(&get(&interpreter, "a")), 5.0);
    assert_eq!(expect_num(&get(&interpreter, "b")), 1.0);
    assert_eq!(expect_num(&get(&interpreter, "c")), 1.0);
}

#[test]
fn conflicting_parents_require_qualification() {
    let source = r#"
        class A { Num x = 1; }
        class B { Num x = 2; }
        class C extends A, B {}
        C c = C();
    "#;
    let err = eval_error(&format!("{source} Num v = c.x;"));
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
    let text = message(&err);
    assert!(text.contains("ambiguous"), "{text}");
    assert!(text.contains("A.x") && text.contains("B.x"), "{text}");

    let interpreter = run(&format!("{source} Num a = c.A.x; Num b = c.B.x;"));
    assert_eq!(expect_num(&get(&interpreter, "a")), 1.0);
    assert_eq!(expect_num(&get(&interpreter, "b")), 2.0);
}

#[test]
fn subclass_instances_fit_parent_types() {
    run("class A {} class B extends A {} A a = B();");
    let err = eval_error("class A {} class B extends A {} B b = A();");
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
    assert_eq!(message(&err), "Cannot assign A to B");
}

#[test]
fn ditlang_functions_bind_parameters() {
    let interpreter = run(
        r#"
        func Ditlang Num add(Num a, Num b) { return a + b; }
        Num total = add(2, 3);
        "#,
    );
    assert_eq!(expect_num(&get(&interpreter, "total")), 5.0);
}

#[test]
fn functions_see_their_defining_scope() {
    let interpreter = run(
        r#"
        class K {
            Num base = 10;
            func Ditlang Num plus(Num n) { return base + n; }
        }
        Num r = K.plus(5);
        "#,
    );
    assert_eq!(expect_num(&get(&interpreter, "r")), 15.0);
}

#[test]
fn anonymous_function_expression() {
    let interpreter = run(
        r#"
        Func twice = func Ditlang Str (Str s) { return s + s; };
        Str out = twice("ab");
        "#,
    );
    assert_eq!(expect_str(&get(&interpreter, "out")), "abab");
}

#[test]
fn missing_arguments_are_reported() {
    let err = eval_error("func Ditlang Num add(Num a, Num b) { return a + b; } add(1);");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
    assert_eq!(message(&err), "add missing 1 required arguments: b");
}

#[test]
fn parameter_types_are_checked() {
    let err = eval_error(r#"func Ditlang Num neg(Num a) { return a; } neg("x");"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
    assert_eq!(message(&err), "Expected 'Num' for parameter 'a', got 'Str'");
}

#[test]
fn return_type_is_enforced() {
    let err = eval_error(r#"func Ditlang Num f() { return "a"; } Num x = f();"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::TypeMismatch));
    assert_eq!(message(&err), "Expected 'Num' for return, got 'Str'");

    let err = eval_error("func Ditlang void g() { return 1; } g();");
    assert_eq!(message(&err), "Expected 'void' for return, got 'Num'");
}

#[test]
fn return_outside_function_is_rejected() {
    let err = eval_error("return 1;");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
    assert_eq!(message(&err), "'return' outside of function");
}

#[test]
fn uncaught_throw_surfaces_as_error() {
    let err = eval_error(r#"func Ditlang void f() { throw "boom"; } f();"#);
    assert_eq!(err.kind(), Some(DiagnosticKind::Thrown));
    assert!(message(&err).contains("boom"));
}

#[test]
fn undeclared_names_are_syntax_errors() {
    let err = eval_error("Num x = y;");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
    assert_eq!(message(&err), "Undeclared variable 'y'");
}

#[test]
fn redeclaring_a_name_fails() {
    let err = eval_error("Num x; Str x;");
    assert_eq!(message(&err), "'x' has already been declared");
}

#[test]
fn missing_semicolon_points_past_the_statement() {
    let err = eval_error("Num x = 1\nNum y = 2;");
    assert_eq!(message(&err), "Expected ';'");
    let origin = err
        .diagnostic()
        .and_then(|diag| diag.origin.clone())
        .expect("error should carry an origin");
    assert_eq!(origin.loc.line, 1);
    assert_eq!(origin.loc.col, 10);
}

#[test]
fn errors_in_functions_carry_a_traceback() {
    let err = eval_error("func Ditlang void f() {\n  Num x = \"a\";\n}\nf();");
    let rendered = err.to_string();
    assert!(rendered.starts_with("Traceback (most recent call last):"), "{rendered}");
    assert!(rendered.contains("f at"), "{rendered}");
    assert!(rendered.contains("line 2"), "{rendered}");
    assert!(rendered.ends_with("TypeMismatchError: Cannot assign Str to Num"), "{rendered}");
}

#[test]
fn string_concatenation_and_number_addition() {
    let interpreter = run(r#"Str s = "a" + 'b' + "c"; Num n = 1.5 + 2;"#);
    assert_eq!(expect_str(&get(&interpreter, "s")), "abc");
    assert_eq!(expect_num(&get(&interpreter, "n")), 3.5);

    let err = eval_error(r#"Thing t = 1 + "a";"#);
    assert_eq!(message(&err), "Cannot add Num and Str");
}

#[test]
fn json_paths_read_and_grow() {
    let interpreter = run(
        r#"
        JSON j = {a: 1, "b": "two"};
        j.c.d = 3;
        Num d = j.c.d;
        Str b = j.b;
        JSON empty;
        empty.x = true;
        Bool x = empty.x;
        "#,
    );
    assert_eq!(expect_num(&get(&interpreter, "d")), 3.0);
    assert_eq!(expect_str(&get(&interpreter, "b")), "two");
    assert_eq!(get(&interpreter, "x"), Value::Bool(true));
}

#[test]
fn redefined_lang_merges_properties() {
    let interpreter = run(
        r#"
        lang L { Str a = "1"; Str b = "x"; }
        lang L { Str b = "2"; }
        Str out = L.a + L.b;
        "#,
    );
    assert_eq!(expect_str(&get(&interpreter, "out")), "12");
}

#[test]
fn higher_priority_lang_keeps_its_properties() {
    let interpreter = run(
        r#"
        lang L { Num priority = 5; Str b = "left"; }
        lang L { Str b = "right"; }
        Str out = L.b;
        "#,
    );
    assert_eq!(expect_str(&get(&interpreter, "out")), "left");
}

#[test]
fn prelude_langs_can_be_extended() {
    let interpreter = run(
        r#"
        lang Python { Str executable_path = "python3.12"; }
        Str exe = Python.executable_path;
        Str ext = Python.file_extension;
        "#,
    );
    assert_eq!(expect_str(&get(&interpreter, "exe")), "python3.12");
    assert_eq!(expect_str(&get(&interpreter, "ext")), "py");
}

#[test]
fn misspelled_lang_suggests_the_prelude_name() {
    let err = eval_error("func Javascript Num f() { return 1; }");
    let diag = err.diagnostic().expect("diagnostic");
    assert_eq!(diag.message, "Undeclared Lang 'Javascript'");
    assert_eq!(diag.notes, vec!["Did you mean 'JavaScript'?".to_string()]);
}

#[test]
fn named_import_exposes_a_dit() {
    let dir = tempdir().expect("create temp dir");
    let lib = dir.path().join("lib.dit");
    fs::write(
        &lib,
        r#"
        Str who = "lib";
        func Ditlang Str hello() { return "hi " + who; }
        "#,
    )
    .expect("write lib");
    let interpreter = run(&format!(
        r#"import lib from "{}"; Str greeting = lib.hello();"#,
        path_literal(&lib)
    ));
    assert_eq!(expect_str(&get(&interpreter, "greeting")), "hi lib");
}

#[test]
fn anonymous_import_shares_slots() {
    let dir = tempdir().expect("create temp dir");
    let lib = dir.path().join("shared.dit");
    fs::write(&lib, "Num counter = 1;").expect("write lib");
    let interpreter = run(&format!(
        r#"import "{}"; counter = 7; Num seen = counter;"#,
        path_literal(&lib)
    ));
    assert_eq!(expect_num(&get(&interpreter, "seen")), 7.0);
}

#[test]
fn relative_imports_resolve_against_the_importer() {
    let dir = tempdir().expect("create temp dir");
    fs::write(dir.path().join("inner.dit"), r#"Str tag = "inner";"#).expect("write inner");
    fs::write(dir.path().join("outer.dit"), r#"import inner from "inner.dit";"#)
        .expect("write outer");
    let interpreter = run(&format!(
        r#"import outer from "{}"; Str tag = outer.inner.tag;"#,
        path_literal(&dir.path().join("outer.dit"))
    ));
    assert_eq!(expect_str(&get(&interpreter, "tag")), "inner");
}

#[test]
fn missing_import_is_a_file_error() {
    let err = eval_error(r#"import nothing from "/definitely/not/here.dit";"#);
    assert_eq!(
        err.kind(),
        Some(DiagnosticKind::File(FileFailure::NotFound))
    );
}

#[test]
fn errors_inside_imports_are_traced() {
    let dir = tempdir().expect("create temp dir");
    let lib = dir.path().join("broken.dit");
    fs::write(&lib, "Num x = \"nope\";").expect("write lib");
    let err = eval_error(&format!(r#"import broken from "{}";"#, path_literal(&lib)));
    let diag = err.diagnostic().expect("diagnostic");
    assert_eq!(diag.kind, DiagnosticKind::TypeMismatch);
    assert_eq!(diag.trace.len(), 1);
    assert_eq!(diag.trace[0].tag, "import");
    assert!(diag
        .origin
        .as_ref()
        .is_some_and(|origin| origin.path.ends_with("broken.dit")));
}

#[test]
fn eval_line_returns_last_expression() {
    let mut interpreter = Interpreter::new();
    interpreter
        .eval_line("Num x = 40;")
        .expect("declaration should succeed");
    let value = interpreter.eval_line("x + 2").expect("expression should succeed");
    assert_eq!(value, Some(Value::Num(42.0)));
}

#[test]
fn guest_delimiters_outside_guest_bodies_are_rejected() {
    let err = eval_error("<| Num x; |>");
    assert_eq!(err.kind(), Some(DiagnosticKind::Syntax));
}
