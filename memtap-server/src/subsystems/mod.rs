pub mod assemble;
pub mod decode;
pub mod intercept;
pub mod reflect;
pub mod sync;
