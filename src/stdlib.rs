use crate::{
    diagnostics::{Diagnostic, Result},
    environment::{Container, ContainerId, ContainerKind, Heap, Slot},
    object::{FuncData, FuncLang, NativeFn, Param},
    runtime::Interpreter,
    value::{format_number, Declared, TypeSpec, Value},
};

const PYTHON: &[(&str, &str)] = &[
    ("executable_path", "python3"),
    ("file_extension", "py"),
    ("function_wrap_left", "def reserved_name(exe_ditlang):"),
    ("function_wrap_right", ""),
    ("export_string", ""),
    ("triangle_expr_left", "exe_ditlang(\"\"\""),
    ("triangle_expr_right", "\"\"\")"),
    ("circle_expr_left", "\"\"\" + str("),
    ("circle_expr_right", ") + \"\"\""),
    ("guest_daemon", include_str!("drivers/python_daemon.py")),
];

const JAVASCRIPT: &[(&str, &str)] = &[
    ("executable_path", "node"),
    ("file_extension", "js"),
    ("function_wrap_left", "async function reserved_name(exe_ditlang) {"),
    ("function_wrap_right", "}"),
    ("export_string", "module.exports = { reserved_name };"),
    ("triangle_expr_left", "(await exe_ditlang(`"),
    ("triangle_expr_right", "`))"),
    ("circle_expr_left", "${"),
    ("circle_expr_right", "}"),
    ("guest_daemon", include_str!("drivers/javascript_daemon.js")),
];

/// Fills the prelude every dit file sees through its scope chain.
pub fn install(heap: &mut Heap, prelude: ContainerId) {
    let thing = |name: &str| Param {
        name: name.into(),
        declared: Declared::THING,
    };
    native(heap, prelude, "print", vec![thing("value")], None, builtin_print);
    native(
        heap,
        prelude,
        "str",
        vec![thing("value")],
        Some(Declared::scalar(TypeSpec::Str)),
        builtin_str,
    );
    native(
        heap,
        prelude,
        "append",
        vec![
            Param {
                name: "list".into(),
                declared: Declared::list_of(TypeSpec::Thing),
            },
            thing("value"),
        ],
        None,
        builtin_append,
    );
    native(
        heap,
        prelude,
        "len",
        vec![thing("value")],
        Some(Declared::scalar(TypeSpec::Num)),
        builtin_len,
    );

    lang(heap, prelude, "Python", PYTHON);
    lang(heap, prelude, "JavaScript", JAVASCRIPT);
}

fn native(
    heap: &mut Heap,
    prelude: ContainerId,
    name: &str,
    params: Vec<Param>,
    ret: Option<Declared>,
    callback: NativeFn,
) {
    let mut data = FuncData::new(params, ret, FuncLang::Ditlang);
    data.native = Some(callback);
    let func = heap.alloc(Container::new(
        Some(name.to_string()),
        ContainerKind::Func(data),
        Some(prelude),
    ));
    bind(heap, prelude, name, TypeSpec::Func, Value::Func(func));
}

fn lang(heap: &mut Heap, prelude: ContainerId, name: &str, props: &[(&str, &str)]) {
    let id = heap.alloc(Container::new(
        Some(name.to_string()),
        ContainerKind::Lang,
        Some(prelude),
    ));
    for (prop, text) in props {
        bind(heap, id, prop, TypeSpec::Str, Value::str(*text));
    }
    bind(heap, prelude, name, TypeSpec::Lang, Value::Lang(id));
}

fn bind(heap: &mut Heap, owner: ContainerId, name: &str, ty: TypeSpec, value: Value) {
    let mut slot = Slot::new(name, Declared::scalar(ty));
    slot.value = value;
    let slot = heap.new_slot(slot);
    heap.container_mut(owner).attrs.insert(name.to_string(), slot);
}

fn builtin_print(interp: &mut Interpreter, args: &[Value]) -> Result<Value> {
    let value = args.first().cloned().unwrap_or_default();
    println!("{}", interp.render(&value));
    Ok(Value::Null)
}

fn builtin_str(interp: &mut Interpreter, args: &[Value]) -> Result<Value> {
    let text = match args.first() {
        Some(Value::Num(number)) => format_number(*number),
        Some(value) => interp.render(value),
        None => String::new(),
    };
    Ok(Value::Str(text))
}

fn builtin_append(interp: &mut Interpreter, args: &[Value]) -> Result<Value> {
    match args {
        [Value::List(list), value] => {
            interp.heap.append(list, value.clone())?;
            Ok(Value::Null)
        }
        [other, _] => Err(Diagnostic::type_mismatch(format!(
            "append expects a list, got '{}'",
            other.type_name()
        ))
        .into()),
        _ => Err(Diagnostic::critical("append called with the wrong arity").into()),
    }
}

fn builtin_len(interp: &mut Interpreter, args: &[Value]) -> Result<Value> {
    let len = match args.first() {
        Some(Value::Str(text)) => text.chars().count(),
        Some(Value::List(list)) => list.borrow().items.len(),
        Some(Value::Json(map)) => map.borrow().len(),
        Some(other) => {
            return Err(Diagnostic::type_mismatch(format!(
                "len expects Str, a list or JSON, got '{}'",
                interp.heap.value_label(other)
            ))
            .into())
        }
        None => 0,
    };
    Ok(Value::Num(len as f64))
}
