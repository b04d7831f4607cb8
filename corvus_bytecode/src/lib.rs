//! Corvus bytecode.
//!
//! The collaborator boundary between class loading and the method compiler:
//! - [`Instruction`]: a stack-machine instruction set addressed by index
//! - [`MethodDescriptor`] / [`TypeKind`]: descriptor parsing
//! - [`ClassDef`] / [`MethodDef`] / [`FieldDef`]: definitions handed to the runtime
//! - [`CodeBuilder`]: label resolution and `max_stack` computation

pub mod builder;
pub mod class_def;
pub mod descriptor;
pub mod instruction;

pub use builder::{BuildError, CodeBuilder, Label};
pub use class_def::{ClassDef, CodeBody, ExceptionHandler, FieldDef, MethodDef, MethodFlags};
pub use descriptor::{DescriptorError, MethodDescriptor, TypeKind};
pub use instruction::{ArrayKind, ClassRef, Condition, FieldRef, Instruction, MethodRef};

/// Name of the root class.
pub const OBJECT_CLASS: &str = "lang/Object";
/// Name of the string class.
pub const STRING_CLASS: &str = "lang/String";
/// Name of the root of the throwable hierarchy.
pub const THROWABLE_CLASS: &str = "lang/Throwable";
/// Name of a constructor method.
pub const CONSTRUCTOR_NAME: &str = "<init>";
