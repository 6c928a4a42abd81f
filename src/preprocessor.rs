use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    diagnostics::{Diagnostic, Result},
    environment::{ContainerId, Heap},
    grammar::{self, Grammar},
    lexer::{CharFeed, SourceView},
};

/// The text a Lang substitutes around guest code and for each delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestMarkers {
    pub wrap_left: String,
    pub wrap_right: String,
    pub export: String,
    pub extension: String,
    pub triangle_left: String,
    pub triangle_right: String,
    pub circle_left: String,
    pub circle_right: String,
}

impl GuestMarkers {
    /// Reads every marker property off `lang`. Only the file extension is required.
    pub fn from_lang(heap: &Heap, lang: ContainerId) -> std::result::Result<Self, Diagnostic> {
        let optional = |prop: &str| heap.lang_prop_opt(lang, prop).unwrap_or_default();
        Ok(Self {
            wrap_left: optional("function_wrap_left"),
            wrap_right: optional("function_wrap_right"),
            export: optional("export_string"),
            extension: heap.lang_prop(lang, "file_extension")?,
            triangle_left: optional("triangle_expr_left"),
            triangle_right: optional("triangle_expr_right"),
            circle_left: optional("circle_expr_left"),
            circle_right: optional("circle_expr_right"),
        })
    }
}

/// Turns a guest function body into a standalone guest source file.
///
/// Even nesting depth is guest code. `<|` opens and `|>` closes a Ditlang span;
/// inside one, `(|` and `|)` bracket a guest expression. Every delimiter is
/// replaced by its marker and the result is framed by the wrap and export text.
pub fn preprocess(view: &SourceView, markers: &GuestMarkers) -> Result<String> {
    let text = view.text();
    let mut feed = CharFeed::new(view.clone());
    let mut out = String::with_capacity(text.len() + markers.wrap_left.len() + 64);
    out.push_str(&markers.wrap_left);

    let mut depth = 0usize;
    let mut copied = 0usize;
    let mut opened_at = Vec::new();
    while !feed.eof() {
        let delimiter = feed
            .peek()
            .and_then(|next| grammar::double([feed.current(), next]));
        let Some(delimiter) = delimiter else {
            feed.pop()?;
            continue;
        };
        let loc = feed.loc();
        let guest = depth % 2 == 0;
        let marker = match delimiter {
            Grammar::TriangleLeft if guest => {
                depth += 1;
                opened_at.push(loc);
                &markers.triangle_left
            }
            Grammar::TriangleRight if !guest => {
                depth -= 1;
                opened_at.pop();
                &markers.triangle_right
            }
            Grammar::CircleLeft if !guest => {
                depth += 1;
                opened_at.push(loc);
                &markers.circle_left
            }
            Grammar::CircleRight if guest && depth > 0 => {
                depth -= 1;
                opened_at.pop();
                &markers.circle_right
            }
            other => {
                let context = if guest { "guest code" } else { "a Ditlang span" };
                return Err(Diagnostic::syntax(format!(
                    "Unexpected '{}' in {context}",
                    other.text()
                ))
                .at(loc)
                .into());
            }
        };
        out.push_str(&text[copied..loc.pos]);
        out.push_str(marker);
        feed.pop()?;
        feed.pop()?;
        copied = feed.loc().pos;
    }
    if let Some(loc) = opened_at.pop() {
        let closer = if depth % 2 == 1 { "|>" } else { "|)" };
        return Err(Diagnostic::syntax(format!("Missing closing '{closer}'"))
            .at(loc)
            .into());
    }
    out.push_str(&text[copied..]);
    out.push('\n');
    out.push_str(&markers.wrap_right);
    out.push_str("\n\n");
    out.push_str(&markers.export);
    Ok(out)
}

pub fn guest_file_name(lang: &str, func: &str, extension: &str) -> String {
    format!("{lang}_func_{func}.{extension}")
}

pub fn write_guest_file(dir: &Path, file_name: &str, contents: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    fs::write(&path, contents)?;
    Ok(path)
}
