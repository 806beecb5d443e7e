/// Growable byte buffers with endian-exact append and peek.
pub mod buffer;
/// Algebraic-constructor objects and the interned nullary forms.
pub mod cons;
/// The heap object header, tags, and raw payload accessors.
pub mod object;
/// Scalar heap values: floats, fixed-width integers, pointer payloads.
pub mod scalar;
/// 128-bit vector-lane values.
pub mod simd;
/// String values, shared tails, and string primitives.
pub mod string;
/// Tagged word representation: small integers and object pointers.
pub mod tagged;
