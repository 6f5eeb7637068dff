//! Status helper enums mapping to SMALLINT columns.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! documented in the initial migration.

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }
    };
}

define_status_enum! {
    /// Background job lifecycle status.
    JobStatus {
        /// Waiting on the queue (or scheduled for a retry).
        Pending = 1,
        /// Claimed by a consumer and executing.
        Running = 2,
        /// Handler finished successfully.
        Completed = 3,
        /// Acknowledged without execution outcome: the referenced entity
        /// no longer exists and retrying cannot help.
        Discarded = 4,
        /// Retry budget exhausted; descriptor copied to `dead_letters`.
        DeadLettered = 5,
        /// Cancelled by omission while still unclaimed.
        Cancelled = 6,
    }
}

define_status_enum! {
    /// Idempotency record status.
    IdempotencyStatus {
        /// First delivery seen; handler not yet completed.
        Pending = 1,
        /// Handler ran to completion; later deliveries are skipped.
        Completed = 2,
    }
}
