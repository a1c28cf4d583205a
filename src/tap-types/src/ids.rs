use std::fmt;

macro_rules! newtype_id {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(v: $inner) -> Self {
                Self(v)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

newtype_id!(
    /// Numeric id of a guest domain.
    DomId(u16)
);

newtype_id!(
    /// Backend-local device id (the virtual disk's "devid" in the frontend path).
    DevId(u32)
);

newtype_id!(
    /// A single grant reference, permitting one page to be mapped from the
    /// owning domain.
    GrantRef(u32)
);

newtype_id!(
    /// A bound or remote event-channel port number.
    EvtchnPort(u32)
);

newtype_id!(
    /// Monotonically increasing per-broker device serial, used to detect
    /// fast create/remove/create recycling of the same (domid, name) pair.
    Serial(i64)
);
