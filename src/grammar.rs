/// Primitive type keywords usable in declarations, parameters and return types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Thing,
    Str,
    Bool,
    Num,
    Json,
    Class,
    Instance,
    Func,
    Dit,
    Lang,
}

impl Primitive {
    pub fn name(self) -> &'static str {
        match self {
            Primitive::Thing => "Thing",
            Primitive::Str => "Str",
            Primitive::Bool => "Bool",
            Primitive::Num => "Num",
            Primitive::Json => "JSON",
            Primitive::Class => "Class",
            Primitive::Instance => "Instance",
            Primitive::Func => "Func",
            Primitive::Dit => "Dit",
            Primitive::Lang => "Lang",
        }
    }
}

/// Marks what a resolved identifier currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Thing,
    Str,
    Bool,
    Num,
    List,
    Json,
    Class,
    Instance,
    Func,
    Dit,
    Lang,
}

/// Every token kind the tokenizer can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grammar {
    // two-character guest delimiters
    TriangleLeft,
    TriangleRight,
    CircleLeft,
    CircleRight,
    // single characters
    QuoteDouble,
    QuoteSingle,
    Dot,
    Equals,
    Plus,
    Comma,
    Semi,
    Colon,
    ParenLeft,
    ParenRight,
    BracketLeft,
    BracketRight,
    BraceLeft,
    BraceRight,
    Backslash,
    // keywords
    Class,
    Extends,
    Func,
    Lang,
    Ditlang,
    Void,
    ListOf,
    Import,
    From,
    Throw,
    Return,
    Null,
    True,
    False,
    Primitive(Primitive),
    // words
    Word,
    NewName,
    Number,
    Value(ValueKind),
    Eof,
}

pub const DOUBLES: &[(&[u8; 2], Grammar)] = &[
    (b"<|", Grammar::TriangleLeft),
    (b"|>", Grammar::TriangleRight),
    (b"(|", Grammar::CircleLeft),
    (b"|)", Grammar::CircleRight),
];

pub const SINGLES: &[(u8, Grammar)] = &[
    (b'"', Grammar::QuoteDouble),
    (b'\'', Grammar::QuoteSingle),
    (b'.', Grammar::Dot),
    (b'=', Grammar::Equals),
    (b'+', Grammar::Plus),
    (b',', Grammar::Comma),
    (b';', Grammar::Semi),
    (b':', Grammar::Colon),
    (b'(', Grammar::ParenLeft),
    (b')', Grammar::ParenRight),
    (b'[', Grammar::BracketLeft),
    (b']', Grammar::BracketRight),
    (b'{', Grammar::BraceLeft),
    (b'}', Grammar::BraceRight),
    (b'\\', Grammar::Backslash),
];

pub const KEYWORDS: &[(&str, Grammar)] = &[
    ("class", Grammar::Class),
    ("extends", Grammar::Extends),
    ("func", Grammar::Func),
    ("lang", Grammar::Lang),
    ("Ditlang", Grammar::Ditlang),
    ("void", Grammar::Void),
    ("listOf", Grammar::ListOf),
    ("import", Grammar::Import),
    ("from", Grammar::From),
    ("throw", Grammar::Throw),
    ("return", Grammar::Return),
    ("null", Grammar::Null),
    ("true", Grammar::True),
    ("false", Grammar::False),
    ("Thing", Grammar::Primitive(Primitive::Thing)),
    ("Str", Grammar::Primitive(Primitive::Str)),
    ("Bool", Grammar::Primitive(Primitive::Bool)),
    ("Num", Grammar::Primitive(Primitive::Num)),
    ("JSON", Grammar::Primitive(Primitive::Json)),
    ("Class", Grammar::Primitive(Primitive::Class)),
    ("Instance", Grammar::Primitive(Primitive::Instance)),
    ("Func", Grammar::Primitive(Primitive::Func)),
    ("Dit", Grammar::Primitive(Primitive::Dit)),
    ("Lang", Grammar::Primitive(Primitive::Lang)),
];

pub fn double(pair: [u8; 2]) -> Option<Grammar> {
    DOUBLES
        .iter()
        .find(|(text, _)| **text == pair)
        .map(|(_, grammar)| *grammar)
}

pub fn single(byte: u8) -> Option<Grammar> {
    SINGLES
        .iter()
        .find(|(ch, _)| *ch == byte)
        .map(|(_, grammar)| *grammar)
}

pub fn keyword(word: &str) -> Option<Grammar> {
    KEYWORDS
        .iter()
        .find(|(text, _)| *text == word)
        .map(|(_, grammar)| *grammar)
}

pub fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

impl Grammar {
    /// Kinds that can begin a type in a declaration, parameter or return type.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Grammar::Primitive(_) | Grammar::Void | Grammar::Value(ValueKind::Class)
        )
    }

    /// Kinds whose value may be followed by `.member`.
    pub fn is_dotable(self) -> bool {
        matches!(
            self,
            Grammar::Value(
                ValueKind::Thing
                    | ValueKind::Json
                    | ValueKind::Class
                    | ValueKind::Instance
                    | ValueKind::Func
                    | ValueKind::Dit
                    | ValueKind::Lang
            )
        )
    }

    pub fn starts_expression(self) -> bool {
        matches!(
            self,
            Grammar::QuoteDouble
                | Grammar::QuoteSingle
                | Grammar::BracketLeft
                | Grammar::BraceLeft
                | Grammar::Number
                | Grammar::True
                | Grammar::False
                | Grammar::Null
                | Grammar::Class
                | Grammar::Func
                | Grammar::Import
                | Grammar::NewName
                | Grammar::Value(_)
        )
    }

    /// Source spelling of fixed tokens, used in error messages.
    pub fn text(self) -> &'static str {
        if let Some((text, _)) = KEYWORDS.iter().find(|(_, grammar)| *grammar == self) {
            return text;
        }
        match self {
            Grammar::TriangleLeft => "<|",
            Grammar::TriangleRight => "|>",
            Grammar::CircleLeft => "(|",
            Grammar::CircleRight => "|)",
            Grammar::QuoteDouble => "\"",
            Grammar::QuoteSingle => "'",
            Grammar::Dot => ".",
            Grammar::Equals => "=",
            Grammar::Plus => "+",
            Grammar::Comma => ",",
            Grammar::Semi => ";",
            Grammar::Colon => ":",
            Grammar::ParenLeft => "(",
            Grammar::ParenRight => ")",
            Grammar::BracketLeft => "[",
            Grammar::BracketRight => "]",
            Grammar::BraceLeft => "{",
            Grammar::BraceRight => "}",
            Grammar::Backslash => "\\",
            Grammar::Word | Grammar::NewName => "name",
            Grammar::Number => "number",
            Grammar::Value(_) => "value",
            Grammar::Eof => "end of input",
            _ => "token",
        }
    }
}
