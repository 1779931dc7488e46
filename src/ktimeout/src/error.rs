//! Result codes returned by the timeout engine
use core::fmt;

/// All result codes (including success) the engine can report.
///
/// The numeric values are the negated errno values a C caller would expect,
/// so a port can forward them across an FFI boundary unchanged.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation was successful.
    Success = 0,
    /// The specified timeout handle does not refer to a live timeout.
    BadId = -2,
    /// The timeout is not pending (it has already fired, was aborted, or was
    /// never scheduled).
    NotFound = -22,
}

impl ResultCode {
    /// Get the numeric value of the result code.
    #[inline]
    pub const fn code(self) -> i8 {
        self as i8
    }

    /// Get a flag indicating whether the code represents a failure.
    #[inline]
    pub const fn is_err(self) -> bool {
        (self as i8) < 0
    }
}

/// Define an error type whose variants are a subset of [`ResultCode`] and
/// share its numeric values.
macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant.code() ),*
        }

        impl $Name {
            /// Get the numeric value of the error code.
            #[inline]
            pub const fn code(self) -> i8 {
                self as i8
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        // Print the same name as the corresponding `ResultCode`
        impl fmt::Debug for $Name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Debug::fmt(&ResultCode::from(*self), f)
            }
        }
    };
}

define_suberror! {
    /// Error type for [`TimeoutEngine::abort_timeout`].
    ///
    /// Racing against expiration is normal, so callers usually treat this as
    /// "the timeout already ran" and carry on.
    ///
    /// [`TimeoutEngine::abort_timeout`]: crate::TimeoutEngine::abort_timeout
    pub enum AbortTimeoutError {
        NotFound,
    }
}

define_suberror! {
    /// Error type for [`TimeoutEngine::destroy_timeout`].
    ///
    /// [`TimeoutEngine::destroy_timeout`]: crate::TimeoutEngine::destroy_timeout
    pub enum DestroyTimeoutError {
        BadId,
    }
}
