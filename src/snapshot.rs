/// Snapshots — "JRRY" Wire Format
///
/// A snapshot serializes one compiled unit tree: header {magic, version,
/// flags, literal-count}, the literal pool (numbers, strings, nested
/// function templates), then the opcode stream plus try records and
/// optional line info. Execution re-interns strings into the loading
/// context, so snapshots move between contexts of the same build. Static
/// snapshots set a flag bit and execute only when the embedder passes
/// `allow_static`. Merged containers concatenate whole snapshots behind an
/// offset table; option flags of merged parts must match.
use crate::bytecode::{ByteCode, LineEntry, ModuleInfo, TryRecord};
use crate::config::CONFIG;
use crate::context::Context;
use crate::errors::ErrorKind;
use crate::heap::{self, CellData, Idx};
use crate::strings;
use crate::value::{HeapKind, Value};
use std::rc::Rc;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"JRRY";
pub const SNAPSHOT_VERSION: u32 = 1;

pub const FLAG_STATIC: u32 = 0x1;
pub const FLAG_MERGED: u32 = 0x2;
pub const FLAG_MODULE: u32 = 0x4;

// literal tags
const LIT_WORD: u8 = 0;
const LIT_NUMBER: u8 = 1;
const LIT_STRING: u8 = 2;
const LIT_BYTECODE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    BadMagic,
    BadVersion,
    Truncated,
    StaticNotAllowed,
    FlagsMismatch,
    SaveDisabled,
    ExecDisabled,
    BadIndex,
}

impl SnapshotError {
    pub fn message(self) -> &'static str {
        match self {
            SnapshotError::BadMagic => "snapshot has an invalid signature",
            SnapshotError::BadVersion => "snapshot version mismatch",
            SnapshotError::Truncated => "snapshot is truncated",
            SnapshotError::StaticNotAllowed => "static snapshots are not allowed here",
            SnapshotError::FlagsMismatch => "snapshot option flags mismatch",
            SnapshotError::SaveDisabled => "snapshot saving is disabled in this build",
            SnapshotError::ExecDisabled => "snapshot execution is disabled in this build",
            SnapshotError::BadIndex => "merged snapshot index out of range",
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }
}

fn write_string_value(ctx: &Context, w: &mut Writer, v: Value) {
    // Strings serialize by content; magic ids stay word-encoded since the
    // table is part of the build the version field pins.
    if v.is_magic_string() || !v.is_string() {
        w.u8(LIT_WORD);
        w.u32(v.raw());
    } else {
        w.u8(LIT_STRING);
        let bytes = strings::bytes_of(ctx, v);
        w.bytes(&bytes);
    }
}

fn write_literal(ctx: &Context, w: &mut Writer, v: Value) {
    if v.is_heap_kind(HeapKind::Number) {
        w.u8(LIT_NUMBER);
        w.f64(ctx.heap.number(Idx(v.heap_cp())));
    } else if v.is_heap_kind(HeapKind::String) {
        w.u8(LIT_STRING);
        let bytes = strings::bytes_of(ctx, v);
        w.bytes(&bytes);
    } else if v.is_heap_kind(HeapKind::ByteCode) {
        w.u8(LIT_BYTECODE);
        let bc = ctx.heap.bytecode(Idx(v.heap_cp()));
        write_unit(ctx, w, &bc);
    } else {
        w.u8(LIT_WORD);
        w.u32(v.raw());
    }
}

fn write_unit(ctx: &Context, w: &mut Writer, bc: &ByteCode) {
    w.u16(bc.flags);
    w.u16(bc.stack_limit);
    w.u32(bc.literals.len() as u32);
    for lit in bc.literals.iter() {
        write_literal(ctx, w, *lit);
    }
    w.u32(bc.arg_names.len() as u32);
    for v in bc.arg_names.iter() {
        write_string_value(ctx, w, *v);
    }
    w.u32(bc.var_names.len() as u32);
    for v in bc.var_names.iter() {
        write_string_value(ctx, w, *v);
    }
    w.u32(bc.func_decls.len() as u32);
    for (name, lit) in bc.func_decls.iter() {
        write_string_value(ctx, w, *name);
        w.u16(*lit);
    }
    w.bytes(&bc.code);
    w.u32(bc.try_records.len() as u32);
    for r in bc.try_records.iter() {
        w.u32(r.start);
        w.u32(r.end);
        w.u32(r.catch_ip);
        w.u32(r.finally_ip);
        w.u16(r.depth);
        w.u16(r.env_depth);
    }
    match &bc.line_info {
        None => w.u32(u32::MAX),
        Some(table) => {
            w.u32(table.len() as u32);
            for e in table.iter() {
                w.u32(e.offset);
                w.u32(e.line);
            }
        }
    }
    match &bc.module {
        None => w.u8(0),
        Some(m) => {
            w.u8(1);
            w.u32(m.requests.len() as u32);
            for r in m.requests.iter() {
                write_string_value(ctx, w, *r);
            }
            w.u32(m.exports.len() as u32);
            for (l, e) in m.exports.iter() {
                write_string_value(ctx, w, *l);
                write_string_value(ctx, w, *e);
            }
        }
    }
    write_string_value(ctx, w, bc.name);
    write_string_value(ctx, w, bc.source_name);
}

/// Serialize the compiled unit behind a script/function/module value.
pub fn save(ctx: &Context, bytecode: &Rc<ByteCode>, static_flag: bool) -> Result<Vec<u8>, SnapshotError> {
    if !CONFIG.snapshot_save {
        return Err(SnapshotError::SaveDisabled);
    }
    let mut w = Writer::new();
    w.buf.extend_from_slice(&SNAPSHOT_MAGIC);
    w.u32(SNAPSHOT_VERSION);
    let mut flags = 0u32;
    if static_flag {
        flags |= FLAG_STATIC;
    }
    if bytecode.is_module() {
        flags |= FLAG_MODULE;
    }
    w.u32(flags);
    w.u32(bytecode.literals.len() as u32);
    write_unit(ctx, &mut w, bytecode);
    Ok(w.buf)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.buf.len() {
            return Err(SnapshotError::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SnapshotError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, SnapshotError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, SnapshotError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(f64::from_le_bytes(arr))
    }

    fn bytes(&mut self) -> Result<&'a [u8], SnapshotError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

fn read_literal(ctx: &mut Context, r: &mut Reader<'_>) -> Result<Value, SnapshotError> {
    match r.u8()? {
        LIT_WORD => Ok(Value::from_raw(r.u32()?)),
        LIT_NUMBER => {
            let n = r.f64()?;
            let v = crate::builtins::make_number(ctx, n);
            ctx.root(v);
            Ok(v)
        }
        LIT_STRING => {
            let bytes = r.bytes()?.to_vec();
            let v = strings::intern_cesu8(ctx, bytes);
            ctx.root(v);
            Ok(v)
        }
        LIT_BYTECODE => {
            let idx = read_unit(ctx, r)?;
            let v = idx.value(HeapKind::ByteCode);
            ctx.root(v);
            Ok(v)
        }
        _ => Err(SnapshotError::Truncated),
    }
}

fn read_unit(ctx: &mut Context, r: &mut Reader<'_>) -> Result<Idx, SnapshotError> {
    let flags = r.u16()?;
    let stack_limit = r.u16()?;
    let lit_count = r.u32()? as usize;
    let mut literals = Vec::with_capacity(lit_count);
    for _ in 0..lit_count {
        literals.push(read_literal(ctx, r)?);
    }
    let argc = r.u32()? as usize;
    let mut arg_names = Vec::with_capacity(argc);
    for _ in 0..argc {
        arg_names.push(read_literal(ctx, r)?);
    }
    let varc = r.u32()? as usize;
    let mut var_names = Vec::with_capacity(varc);
    for _ in 0..varc {
        var_names.push(read_literal(ctx, r)?);
    }
    let fdc = r.u32()? as usize;
    let mut func_decls = Vec::with_capacity(fdc);
    for _ in 0..fdc {
        let name = read_literal(ctx, r)?;
        let lit = r.u16()?;
        func_decls.push((name, lit));
    }
    let code = r.bytes()?.to_vec();
    let trc = r.u32()? as usize;
    let mut try_records = Vec::with_capacity(trc);
    for _ in 0..trc {
        try_records.push(TryRecord {
            start: r.u32()?,
            end: r.u32()?,
            catch_ip: r.u32()?,
            finally_ip: r.u32()?,
            depth: r.u16()?,
            env_depth: r.u16()?,
        });
    }
    let line_count = r.u32()?;
    let line_info = if line_count == u32::MAX {
        None
    } else {
        let mut table = Vec::with_capacity(line_count as usize);
        for _ in 0..line_count {
            table.push(LineEntry {
                offset: r.u32()?,
                line: r.u32()?,
            });
        }
        Some(table.into_boxed_slice())
    };
    let module = if r.u8()? == 1 {
        let reqc = r.u32()? as usize;
        let mut requests = Vec::with_capacity(reqc);
        for _ in 0..reqc {
            requests.push(read_literal(ctx, r)?);
        }
        let expc = r.u32()? as usize;
        let mut exports = Vec::with_capacity(expc);
        for _ in 0..expc {
            let l = read_literal(ctx, r)?;
            let e = read_literal(ctx, r)?;
            exports.push((l, e));
        }
        Some(Box::new(ModuleInfo {
            requests: requests.into_boxed_slice(),
            exports: exports.into_boxed_slice(),
        }))
    } else {
        None
    };
    let name = read_literal(ctx, r)?;
    let source_name = read_literal(ctx, r)?;

    let bc = ByteCode {
        flags,
        arg_names: arg_names.into_boxed_slice(),
        var_names: var_names.into_boxed_slice(),
        func_decls: func_decls.into_boxed_slice(),
        stack_limit,
        literals: literals.into_boxed_slice(),
        code: code.into_boxed_slice(),
        try_records: try_records.into_boxed_slice(),
        line_info,
        module,
        name,
        source_name,
        user_value: Value::UNDEFINED,
    };
    Ok(heap::alloc(ctx, CellData::ByteCode(Rc::new(bc))))
}

/// Header check + unit load; returns the bytecode cell and snapshot flags.
pub fn load(
    ctx: &mut Context,
    buffer: &[u8],
    allow_static: bool,
) -> Result<(Idx, u32), SnapshotError> {
    if !CONFIG.snapshot_exec {
        return Err(SnapshotError::ExecDisabled);
    }
    let mut r = Reader::new(buffer);
    if r.take(4)? != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if r.u32()? != SNAPSHOT_VERSION {
        return Err(SnapshotError::BadVersion);
    }
    let flags = r.u32()?;
    if flags & FLAG_STATIC != 0 && !allow_static {
        return Err(SnapshotError::StaticNotAllowed);
    }
    let _literal_count = r.u32()?;
    let mark = ctx.roots_mark();
    let result = read_unit(ctx, &mut r);
    ctx.roots_release(mark);
    let idx = result?;
    Ok((idx, flags))
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

fn option_flags(buffer: &[u8]) -> Result<u32, SnapshotError> {
    let mut r = Reader::new(buffer);
    if r.take(4)? != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if r.u32()? != SNAPSHOT_VERSION {
        return Err(SnapshotError::BadVersion);
    }
    r.u32()
}

/// Concatenate snapshots behind an offset table. Parts must agree on their
/// option flags.
pub fn merge(parts: &[&[u8]]) -> Result<Vec<u8>, SnapshotError> {
    let mut flags: Option<u32> = None;
    for p in parts {
        let f = option_flags(p)? & (FLAG_STATIC | FLAG_MODULE);
        match flags {
            None => flags = Some(f),
            Some(prev) if prev == f => {}
            Some(_) => return Err(SnapshotError::FlagsMismatch),
        }
    }
    let mut w = Writer::new();
    w.buf.extend_from_slice(&SNAPSHOT_MAGIC);
    w.u32(SNAPSHOT_VERSION);
    w.u32(flags.unwrap_or(0) | FLAG_MERGED);
    w.u32(parts.len() as u32);
    let table_at = w.buf.len();
    for _ in parts {
        w.u32(0); // offset patched below
        w.u32(0); // length
    }
    for (i, p) in parts.iter().enumerate() {
        let offset = w.buf.len() as u32;
        let len = p.len() as u32;
        let slot = table_at + i * 8;
        w.buf[slot..slot + 4].copy_from_slice(&offset.to_le_bytes());
        w.buf[slot + 4..slot + 8].copy_from_slice(&len.to_le_bytes());
        w.buf.extend_from_slice(p);
    }
    Ok(w.buf)
}

/// Extract part `index` of a merged container.
pub fn merged_part<'a>(buffer: &'a [u8], index: usize) -> Result<&'a [u8], SnapshotError> {
    let mut r = Reader::new(buffer);
    if r.take(4)? != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if r.u32()? != SNAPSHOT_VERSION {
        return Err(SnapshotError::BadVersion);
    }
    let flags = r.u32()?;
    if flags & FLAG_MERGED == 0 {
        if index == 0 {
            return Ok(buffer);
        }
        return Err(SnapshotError::BadIndex);
    }
    let count = r.u32()? as usize;
    if index >= count {
        return Err(SnapshotError::BadIndex);
    }
    for _ in 0..index {
        r.u32()?;
        r.u32()?;
    }
    let offset = r.u32()? as usize;
    let len = r.u32()? as usize;
    if offset + len > buffer.len() {
        return Err(SnapshotError::Truncated);
    }
    Ok(&buffer[offset..offset + len])
}

/// Error-value flavour of a snapshot failure for the public API.
pub fn snapshot_error_value(ctx: &mut Context, err: SnapshotError) -> Value {
    crate::builtins::make_error(ctx, ErrorKind::TypeError, err.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{self, ParseOptions};

    fn compile(ctx: &mut Context, src: &str) -> Rc<ByteCode> {
        let idx = parser::parse_source(ctx, src, &ParseOptions::default()).unwrap();
        ctx.heap.bytecode(idx)
    }

    #[test]
    fn round_trip_preserves_code_and_literals() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let bc = compile(
            &mut ctx,
            "function f(a, b) { return a + b * 2.5 } var r = f(1, 'x');",
        );
        let snap = save(&ctx, &bc, false).unwrap();
        let (idx, flags) = load(&mut ctx, &snap, false).unwrap();
        assert_eq!(flags & FLAG_STATIC, 0);
        let loaded = ctx.heap.bytecode(idx);
        assert_eq!(loaded.code, bc.code);
        assert_eq!(loaded.literals.len(), bc.literals.len());
        assert_eq!(loaded.flags, bc.flags);
        assert_eq!(loaded.stack_limit, bc.stack_limit);
        assert_eq!(loaded.var_names.len(), bc.var_names.len());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let err = load(&mut ctx, b"NOPE\0\0\0\0", false).unwrap_err();
        assert_eq!(err, SnapshotError::BadMagic);
    }

    #[test]
    fn static_flag_requires_permission() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let bc = compile(&mut ctx, "1 + 1;");
        let snap = save(&ctx, &bc, true).unwrap();
        assert_eq!(
            load(&mut ctx, &snap, false).unwrap_err(),
            SnapshotError::StaticNotAllowed
        );
        assert!(load(&mut ctx, &snap, true).is_ok());
    }

    #[test]
    fn merge_and_extract() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let bc_a = compile(&mut ctx, "1;");
        let bc_b = compile(&mut ctx, "2;");
        let a = save(&ctx, &bc_a, false).unwrap();
        let b = save(&ctx, &bc_b, false).unwrap();
        let merged = merge(&[&a, &b]).unwrap();
        assert_eq!(merged_part(&merged, 0).unwrap(), a.as_slice());
        assert_eq!(merged_part(&merged, 1).unwrap(), b.as_slice());
        assert_eq!(
            merged_part(&merged, 2).unwrap_err(),
            SnapshotError::BadIndex
        );
    }

    #[test]
    fn merge_rejects_mixed_flags() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let bc_plain = compile(&mut ctx, "1;");
        let bc_static = compile(&mut ctx, "2;");
        let plain = save(&ctx, &bc_plain, false).unwrap();
        let statik = save(&ctx, &bc_static, true).unwrap();
        assert_eq!(
            merge(&[&plain, &statik]).unwrap_err(),
            SnapshotError::FlagsMismatch
        );
    }
}
