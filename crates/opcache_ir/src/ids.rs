//! Index newtypes for pooled image nodes.

use crate::arena::ArenaId;
use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
        pub struct $name(u32);

        impl ArenaId for $name {
            fn from_raw(index: u32) -> Self {
                Self(index)
            }

            fn as_raw(self) -> u32 {
                self.0
            }
        }
    };
}

define_id!(
    /// A literal in an image's constant table.
    ConstId
);

define_id!(
    /// An instruction sequence (file body, function body, or method body).
    OpArrayId
);

define_id!(
    /// A function or method definition.
    FunctionId
);

define_id!(
    /// A class definition.
    ClassId
);
