//! Compiler and virtual machine for the Rime scripting language.
//!
//! Rime is a small dynamically-typed object-oriented language. This crate
//! contains its runtime core: a tracing garbage collector ([`heap`]), the
//! tagged value and class model ([`value`]), a stack-based bytecode
//! interpreter ([`vm`]) and a compiler lowering expression trees to
//! bytecode ([`compile`]). The surface parser and the library of
//! primitive methods live outside this crate; they talk to it through
//! [`syntax::ast`] and the foreign function interface in [`value`].
//!
//! All state is owned by a [`context::Context`]; there are no globals.
//! Independent contexts may coexist as long as values from one are never
//! mixed into another.

#![warn(missing_docs)]

pub mod bytecode;
pub mod compile;
pub mod context;
pub mod heap;
pub mod syntax;
pub mod value;
pub mod vm;
