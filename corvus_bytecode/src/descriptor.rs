//! Type descriptors.
//!
//! Method descriptors use the familiar compact form `(IJLpkg/Name;[I)V`.
//! Every value occupies exactly one 64-bit slot at runtime, so the compiler
//! only needs to distinguish integers, longs, object references and void.

use std::fmt;
use thiserror::Error;

/// Runtime category of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// 32-bit integer (also booleans, bytes, chars and shorts).
    Int,
    /// 64-bit integer.
    Long,
    /// Object or array reference (may be null).
    Object,
    /// No value. Only valid as a return type.
    Void,
}

impl TypeKind {
    /// Whether values of this kind are heap references.
    #[inline]
    pub const fn is_reference(self) -> bool {
        matches!(self, TypeKind::Object)
    }

    /// Descriptor character for this kind.
    pub const fn descriptor_char(self) -> char {
        match self {
            TypeKind::Int => 'I',
            TypeKind::Long => 'J',
            TypeKind::Object => 'L',
            TypeKind::Void => 'V',
        }
    }

    /// Parse a field descriptor such as `I`, `J`, `Lpkg/Name;` or `[I`.
    pub fn parse_field(descriptor: &str) -> Result<TypeKind, DescriptorError> {
        let mut parser = Parser::new(descriptor);
        let kind = parser.field_type()?;
        if kind == TypeKind::Void {
            return Err(DescriptorError::VoidField(descriptor.to_string()));
        }
        parser.expect_end()?;
        Ok(kind)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Int => "int",
            TypeKind::Long => "long",
            TypeKind::Object => "object",
            TypeKind::Void => "void",
        };
        f.write_str(name)
    }
}

/// Errors produced while parsing descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("unexpected end of descriptor `{0}`")]
    UnexpectedEnd(String),
    #[error("unexpected character `{ch}` at {position} in `{descriptor}`")]
    UnexpectedChar {
        descriptor: String,
        position: usize,
        ch: char,
    },
    #[error("trailing characters in descriptor `{0}`")]
    Trailing(String),
    #[error("void is not a valid parameter or field type in `{0}`")]
    VoidField(String),
}

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    params: Box<[TypeKind]>,
    ret: TypeKind,
}

impl MethodDescriptor {
    /// Build a descriptor directly from its parts.
    pub fn new(params: impl Into<Box<[TypeKind]>>, ret: TypeKind) -> Self {
        Self {
            params: params.into(),
            ret,
        }
    }

    /// Parse a method descriptor.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut parser = Parser::new(descriptor);
        parser.expect('(')?;
        let mut params = Vec::new();
        while parser.peek() != Some(')') {
            let kind = parser.field_type()?;
            if kind == TypeKind::Void {
                return Err(DescriptorError::VoidField(descriptor.to_string()));
            }
            params.push(kind);
        }
        parser.expect(')')?;
        let ret = parser.field_type()?;
        parser.expect_end()?;
        Ok(Self {
            params: params.into_boxed_slice(),
            ret,
        })
    }

    /// Declared parameter kinds, excluding any receiver.
    #[inline]
    pub fn params(&self) -> &[TypeKind] {
        &self.params
    }

    /// Return kind.
    #[inline]
    pub fn return_kind(&self) -> TypeKind {
        self.ret
    }

    /// Number of declared parameters.
    #[inline]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

struct Parser<'a> {
    text: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.char_indices().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn next(&mut self) -> Result<(usize, char), DescriptorError> {
        self.chars
            .next()
            .ok_or_else(|| DescriptorError::UnexpectedEnd(self.text.to_string()))
    }

    fn expect(&mut self, want: char) -> Result<(), DescriptorError> {
        let (position, ch) = self.next()?;
        if ch != want {
            return Err(self.unexpected(position, ch));
        }
        Ok(())
    }

    fn expect_end(&mut self) -> Result<(), DescriptorError> {
        match self.chars.next() {
            None => Ok(()),
            Some(_) => Err(DescriptorError::Trailing(self.text.to_string())),
        }
    }

    fn unexpected(&self, position: usize, ch: char) -> DescriptorError {
        DescriptorError::UnexpectedChar {
            descriptor: self.text.to_string(),
            position,
            ch,
        }
    }

    fn field_type(&mut self) -> Result<TypeKind, DescriptorError> {
        let (position, ch) = self.next()?;
        match ch {
            'I' | 'Z' | 'B' | 'C' | 'S' => Ok(TypeKind::Int),
            'J' => Ok(TypeKind::Long),
            'V' => Ok(TypeKind::Void),
            'L' => {
                loop {
                    let (_, c) = self.next()?;
                    if c == ';' {
                        break;
                    }
                }
                Ok(TypeKind::Object)
            }
            '[' => {
                // The element type must itself be well formed.
                let element = self.field_type()?;
                if element == TypeKind::Void {
                    return Err(DescriptorError::VoidField(self.text.to_string()));
                }
                Ok(TypeKind::Object)
            }
            other => Err(self.unexpected(position, other)),
        }
    }
}
