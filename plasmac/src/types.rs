//! Source-level types and the program's type environment.
//!
//! Types here are what signatures and constructor fields are written in;
//! the solver works over its own [`Domain`](crate::typeck::solver::Domain)
//! representation and converts back to these when a solution is built.

use std::collections::BTreeSet;
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

id_type!(
    /// A user-defined type, by index into [`Program::types`].
    TypeId
);
id_type!(
    /// A constructor, by index into [`Program::ctors`].
    CtorId
);
id_type!(
    /// A resource, by index into [`Program::resources`].
    ResourceId
);
id_type!(
    /// A function declaration, by index into [`Program::funcs`].
    FuncId
);

/// The built-in types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuiltinType {
    Int,
    String,
    Codepoint,
    StringPos,
}

impl fmt::Display for BuiltinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuiltinType::Int => "Int",
            BuiltinType::String => "String",
            BuiltinType::Codepoint => "Codepoint",
            BuiltinType::StringPos => "StringPos",
        };
        write!(f, "{name}")
    }
}

/// A source type expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Builtin(BuiltinType),
    /// A type variable, scoped to the declaration it appears in.
    Var(String),
    /// An application of a user type to arguments.
    Ref(TypeId, Vec<Type>),
    Func(Box<FuncType>),
}

/// A function type with its resource annotations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncType {
    pub inputs: Vec<Type>,
    pub outputs: Vec<Type>,
    pub uses: BTreeSet<ResourceId>,
    pub observes: BTreeSet<ResourceId>,
}

/// A user type definition: name, parameters and constructors.
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub params: Vec<String>,
    pub ctors: Vec<CtorId>,
}

/// One constructor of a user type. Field types may mention the owning
/// type's parameters.
#[derive(Debug, Clone)]
pub struct CtorDef {
    pub name: String,
    pub owner: TypeId,
    pub fields: Vec<Type>,
}

/// A declared resource.
#[derive(Debug, Clone)]
pub struct ResourceDef {
    pub name: String,
}

/// A function declaration: its signature, parameter names, and the types
/// of any captured variables for closures over it.
#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: String,
    pub params: Vec<String>,
    pub sig: FuncType,
    pub captured: Vec<Type>,
}

/// The typed program environment the checker runs against.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub types: Vec<TypeDef>,
    pub ctors: Vec<CtorDef>,
    pub resources: Vec<ResourceDef>,
    pub funcs: Vec<FuncDecl>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id.index()]
    }

    pub fn ctor(&self, id: CtorId) -> &CtorDef {
        &self.ctors[id.index()]
    }

    pub fn func(&self, id: FuncId) -> &FuncDecl {
        &self.funcs[id.index()]
    }

    pub fn resource_name(&self, id: ResourceId) -> &str {
        &self.resources[id.index()].name
    }

    pub fn add_type(&mut self, name: &str, params: &[&str]) -> TypeId {
        self.types.push(TypeDef {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            ctors: Vec::new(),
        });
        TypeId(self.types.len() as u32 - 1)
    }

    pub fn add_ctor(&mut self, owner: TypeId, name: &str, fields: Vec<Type>) -> CtorId {
        let id = CtorId(self.ctors.len() as u32);
        self.ctors.push(CtorDef {
            name: name.to_string(),
            owner,
            fields,
        });
        self.types[owner.index()].ctors.push(id);
        id
    }

    pub fn add_resource(&mut self, name: &str) -> ResourceId {
        self.resources.push(ResourceDef {
            name: name.to_string(),
        });
        ResourceId(self.resources.len() as u32 - 1)
    }

    pub fn add_func(&mut self, decl: FuncDecl) -> FuncId {
        self.funcs.push(decl);
        FuncId(self.funcs.len() as u32 - 1)
    }

    /// Render a type for messages, e.g. `List(Int)`.
    pub fn show_type(&self, ty: &Type) -> String {
        match ty {
            Type::Builtin(b) => b.to_string(),
            Type::Var(name) => name.clone(),
            Type::Ref(id, args) => {
                let name = &self.type_def(*id).name;
                if args.is_empty() {
                    name.clone()
                } else {
                    let args: Vec<_> = args.iter().map(|a| self.show_type(a)).collect();
                    format!("{}({})", name, args.join(", "))
                }
            }
            Type::Func(ft) => {
                let ins: Vec<_> = ft.inputs.iter().map(|t| self.show_type(t)).collect();
                let outs: Vec<_> = ft.outputs.iter().map(|t| self.show_type(t)).collect();
                format!("func({}) -> ({})", ins.join(", "), outs.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_builders() {
        let mut program = Program::new();
        let list = program.add_type("List", &["T"]);
        let nil = program.add_ctor(list, "Nil", vec![]);
        let cons = program.add_ctor(
            list,
            "Cons",
            vec![
                Type::Var("T".into()),
                Type::Ref(list, vec![Type::Var("T".into())]),
            ],
        );
        assert_eq!(program.type_def(list).ctors, vec![nil, cons]);
        assert_eq!(program.ctor(cons).fields.len(), 2);
        assert_eq!(program.ctor(nil).owner, list);
    }

    #[test]
    fn test_show_type() {
        let mut program = Program::new();
        let list = program.add_type("List", &["T"]);
        let ty = Type::Ref(list, vec![Type::Builtin(BuiltinType::Int)]);
        assert_eq!(program.show_type(&ty), "List(Int)");
        assert_eq!(
            program.show_type(&Type::Builtin(BuiltinType::Codepoint)),
            "Codepoint"
        );
    }
}
