/// Error taxonomy.
///
/// Four tiers, mirroring how failures leave the engine:
///   fatal        — unrecoverable; surfaces through the port's `fatal` hook
///   exception    — any ECMA throw; a value carried on the `Err` side of
///                  internal results and error-marked at the API boundary
///   abort        — engineered uncatchable exception (halt callback,
///                  `throw_abort`); bypasses JS try/catch
///   parse error  — SyntaxError with a stable id from the parser
///
/// The standard Error hierarchy (Type/Range/Reference/…) is `ErrorKind`.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Fatal codes
// ---------------------------------------------------------------------------

/// Process-terminating conditions. Handed to `Port::fatal`, which must not
/// return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalCode {
    #[error("out of memory")]
    OutOfMemory,
    #[error("reference count limit reached")]
    RefCountLimit,
    #[error("disabled byte code executed")]
    DisabledByteCode,
    #[error("failed internal assertion")]
    FailedInternalAssertion,
    #[error("unterminated engine state")]
    Unterminated,
}

// ---------------------------------------------------------------------------
// ECMA error hierarchy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    UriError,
    EvalError,
    AggregateError,
}

impl ErrorKind {
    pub fn constructor_name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::UriError => "URIError",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::AggregateError => "AggregateError",
        }
    }
}

// ---------------------------------------------------------------------------
// Parser error ids
// ---------------------------------------------------------------------------

/// Stable identifiers for every way a parse can fail. The id survives even
/// when human-readable messages are compiled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParserErrId {
    #[error("unexpected end of source")]
    UnexpectedEos,
    #[error("invalid character")]
    InvalidCharacter,
    #[error("invalid numeric literal")]
    InvalidNumber,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated template literal")]
    UnterminatedTemplate,
    #[error("unterminated regexp literal")]
    UnterminatedRegExp,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("identifier expected")]
    IdentifierExpected,
    #[error("unexpected token")]
    UnexpectedToken,
    #[error("expression expected")]
    ExpressionExpected,
    #[error("statement expected")]
    StatementExpected,
    #[error("left parenthesis expected")]
    LeftParenExpected,
    #[error("right parenthesis expected")]
    RightParenExpected,
    #[error("left brace expected")]
    LeftBraceExpected,
    #[error("right brace expected")]
    RightBraceExpected,
    #[error("right square bracket expected")]
    RightSquareExpected,
    #[error("colon expected")]
    ColonExpected,
    #[error("semicolon expected")]
    SemicolonExpected,
    #[error("identifier already declared")]
    DuplicateDeclaration,
    #[error("duplicate parameter name not allowed in this context")]
    DuplicateParameter,
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,
    #[error("'return' outside of function")]
    ReturnOutsideFunction,
    #[error("'await' outside of async function")]
    AwaitOutsideAsync,
    #[error("'yield' outside of generator")]
    YieldOutsideGenerator,
    #[error("illegal break statement")]
    IllegalBreak,
    #[error("illegal continue statement")]
    IllegalContinue,
    #[error("'catch' or 'finally' expected")]
    CatchOrFinallyExpected,
    #[error("cannot assign to a constant binding")]
    AssignToConst,
    #[error("'with' statements are not supported")]
    WithNotSupported,
    #[error("'switch' statements are outside the supported subset")]
    SwitchNotSupported,
    #[error("destructuring patterns are outside the supported subset")]
    DestructuringNotSupported,
    #[error("rest and spread are outside the supported subset")]
    SpreadNotSupported,
    #[error("'class' declarations are outside the supported subset")]
    ClassNotSupported,
    #[error("'for-in' and 'for-of' are outside the supported subset")]
    ForInOfNotSupported,
    #[error("BigInt literals are disabled in this build")]
    BigIntDisabled,
    #[error("octal literals are not allowed in strict mode")]
    StrictOctal,
    #[error("delete of an unqualified identifier in strict mode")]
    StrictDelete,
    #[error("assignment to eval or arguments in strict mode")]
    StrictEvalArguments,
    #[error("import/export only allowed at module top level")]
    ModuleItemNotAtTop,
    #[error("module source expected after 'from'")]
    ModuleSourceExpected,
    #[error("too many literals in one function")]
    LiteralLimitReached,
    #[error("the parser is disabled in this build")]
    ParserDisabled,
    #[error("expression nesting level exceeded")]
    NestingLimitReached,
}

/// A parse failure: stable id plus the 1-based source position it was
/// detected at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParseError {
    pub id: ParserErrId,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    pub fn new(id: ParserErrId, line: u32, column: u32) -> Self {
        ParseError { id, line, column }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}:{}]", self.id, self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_formats_position() {
        let e = ParseError::new(ParserErrId::UnexpectedToken, 3, 14);
        assert_eq!(format!("{}", e), "unexpected token [3:14]");
    }

    #[test]
    fn fatal_code_messages() {
        assert_eq!(format!("{}", FatalCode::OutOfMemory), "out of memory");
    }
}
