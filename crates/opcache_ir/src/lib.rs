//! Compiled-artifact model for the opcache.
//!
//! Two representations of the same compiled file live here:
//!
//! - the **live** model ([`FileUnit`], [`OpArray`], [`Function`], [`Class`],
//!   [`Constant`]) is an `Arc` graph owned by the executing process, where one
//!   node may be reachable along several paths;
//! - the **pooled** image ([`FileImage`] over a [`UnitImage`]) stores the same
//!   graph as dense arenas whose nodes refer to each other by ID, so that
//!   relinking a copy is a mapping over indices rather than pointer chasing.
//!
//! Converting between the two is the job of the `opcache_pool` crate.

#![warn(missing_docs)]

pub mod arena;
pub mod footprint;
pub mod ids;
pub mod image;
pub mod unit;

pub use arena::{Arena, ArenaId};
pub use footprint::Footprint;
pub use ids::{ClassId, ConstId, FunctionId, OpArrayId};
pub use image::{ClassImage, ConstImage, FileImage, FunctionImage, OpArrayImage, UnitImage};
pub use unit::{Class, Constant, FileUnit, Function, Op, OpArray};

/// Returns `true` for file-scoped names that the compiler mangles with a
/// leading NUL byte.
///
/// Mangled definitions are unique to the file that declared them; installing
/// one that already exists is not a conflict.
pub fn is_mangled(name: &str) -> bool {
    name.starts_with('\0')
}

/// Builds the file-scoped name a class body is registered under when its
/// binding is deferred to run time.
pub fn mangle(name: &str, filename: &std::path::Path, line: u32) -> String {
    format!("\0{name}{}:{line}", filename.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangled_names() {
        assert!(is_mangled("\0closure/srv/a.src:3"));
        assert!(!is_mangled("Widget"));
        assert!(!is_mangled(""));
    }

    #[test]
    fn mangled_names_are_file_scoped() {
        let a = mangle("Child", std::path::Path::new("/srv/a.src"), 3);
        let b = mangle("Child", std::path::Path::new("/srv/b.src"), 3);
        assert!(is_mangled(&a));
        assert_ne!(a, b);
    }
}
