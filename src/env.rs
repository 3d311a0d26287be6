/// Environment Records
///
/// Lexical and variable scopes. A declarative record holds its bindings
/// inline (small scopes dominate, so a vector beats a map); the object
/// record fronts the global object. Binding names are canonical interned
/// string values, so lookup is word comparison.
use crate::context::Context;
use crate::heap::{self, CellData, Idx, OptIdx};
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub value: Value,
    pub mutable: bool,
    /// let/const start uninitialized (TDZ); `var` and parameters start
    /// initialized.
    pub initialized: bool,
}

#[derive(Debug)]
pub enum EnvKind {
    Declarative { bindings: Vec<(Value, Binding)> },
    /// Binding object record; the global environment.
    Object { object: Idx },
}

#[derive(Debug)]
pub struct EnvCell {
    pub parent: OptIdx,
    pub kind: EnvKind,
}

impl EnvCell {
    pub fn booked_extra(&self) -> usize {
        match &self.kind {
            EnvKind::Declarative { bindings } => {
                bindings.capacity() * std::mem::size_of::<(Value, Binding)>()
            }
            EnvKind::Object { .. } => 0,
        }
    }
}

pub fn alloc_declarative(ctx: &mut Context, parent: OptIdx) -> Idx {
    heap::alloc(
        ctx,
        CellData::Env(Box::new(EnvCell {
            parent,
            kind: EnvKind::Declarative {
                bindings: Vec::new(),
            },
        })),
    )
}

pub fn alloc_object_env(ctx: &mut Context, parent: OptIdx, object: Idx) -> Idx {
    heap::alloc(
        ctx,
        CellData::Env(Box::new(EnvCell {
            parent,
            kind: EnvKind::Object { object },
        })),
    )
}

/// Create (or overwrite) a binding in a declarative record.
pub fn declare(ctx: &mut Context, env: Idx, name: Value, mutable: bool, initialized: bool) {
    let value = if initialized {
        Value::UNDEFINED
    } else {
        Value::UNINITIALIZED
    };
    match &mut ctx.heap.env_mut(env).kind {
        EnvKind::Declarative { bindings } => {
            for (n, b) in bindings.iter_mut() {
                if *n == name {
                    // Re-declaration (var after var); keep the stronger
                    // initialized state.
                    b.mutable = mutable;
                    b.initialized = b.initialized || initialized;
                    return;
                }
            }
            bindings.push((
                name,
                Binding {
                    value,
                    mutable,
                    initialized,
                },
            ));
        }
        EnvKind::Object { .. } => {
            unreachable!("declare on object environment goes through properties")
        }
    }
}

/// Find the environment holding `name`, walking parents.
pub fn resolve(ctx: &Context, mut env: OptIdx, name: Value) -> Option<(Idx, usize)> {
    while let Some(e) = env.get() {
        match &ctx.heap.env(e).kind {
            EnvKind::Declarative { bindings } => {
                if let Some(pos) = bindings.iter().position(|(n, _)| *n == name) {
                    return Some((e, pos));
                }
            }
            EnvKind::Object { .. } => {
                // Object records answer through the property machinery; the
                // caller distinguishes them by slot usize::MAX.
                return Some((e, usize::MAX));
            }
        }
        env = ctx.heap.env(e).parent;
    }
    None
}

/// Read a declarative binding by position.
pub fn read_binding(ctx: &Context, env: Idx, pos: usize) -> Binding {
    match &ctx.heap.env(env).kind {
        EnvKind::Declarative { bindings } => bindings[pos].1,
        EnvKind::Object { .. } => unreachable!("positional read on object environment"),
    }
}

/// Write a declarative binding by position; marks it initialized.
pub fn write_binding(ctx: &mut Context, env: Idx, pos: usize, value: Value) {
    match &mut ctx.heap.env_mut(env).kind {
        EnvKind::Declarative { bindings } => {
            let b = &mut bindings[pos].1;
            b.value = value;
            b.initialized = true;
        }
        EnvKind::Object { .. } => unreachable!("positional write on object environment"),
    }
}

/// Whether a declarative record already has `name` (for duplicate-let
/// detection at run time).
pub fn has_own_binding(ctx: &Context, env: Idx, name: Value) -> bool {
    match &ctx.heap.env(env).kind {
        EnvKind::Declarative { bindings } => bindings.iter().any(|(n, _)| *n == name),
        EnvKind::Object { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings;

    #[test]
    fn declare_resolve_read_write() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let env = alloc_declarative(&mut ctx, OptIdx::NONE);
        let name = strings::intern_utf8(&mut ctx, "x");
        declare(&mut ctx, env, name, true, true);
        let (e, pos) = resolve(&ctx, env.some(), name).unwrap();
        assert_eq!(e, env);
        assert_eq!(read_binding(&ctx, e, pos).value, Value::UNDEFINED);
        write_binding(&mut ctx, e, pos, Value::from_i30(3));
        assert_eq!(read_binding(&ctx, e, pos).value, Value::from_i30(3));
    }

    #[test]
    fn resolve_walks_parents() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let outer = alloc_declarative(&mut ctx, OptIdx::NONE);
        let inner = alloc_declarative(&mut ctx, outer.some());
        let name = strings::intern_utf8(&mut ctx, "captured");
        declare(&mut ctx, outer, name, true, true);
        let (e, _) = resolve(&ctx, inner.some(), name).unwrap();
        assert_eq!(e, outer);
    }

    #[test]
    fn tdz_binding_starts_uninitialized() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let env = alloc_declarative(&mut ctx, OptIdx::NONE);
        let name = strings::intern_utf8(&mut ctx, "later");
        declare(&mut ctx, env, name, true, false);
        let (e, pos) = resolve(&ctx, env.some(), name).unwrap();
        assert!(!read_binding(&ctx, e, pos).initialized);
        assert!(read_binding(&ctx, e, pos).value.is_uninitialized());
    }

    #[test]
    fn missing_name_resolves_to_none() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let env = alloc_declarative(&mut ctx, OptIdx::NONE);
        let name = strings::intern_utf8(&mut ctx, "ghost");
        assert!(resolve(&ctx, env.some(), name).is_none());
    }
}
