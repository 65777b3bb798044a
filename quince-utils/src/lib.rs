pub mod aarch64;
pub mod bit_misc;
pub mod macho;
pub mod x86_64;
