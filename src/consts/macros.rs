/// For naming a new enum, passing in what type it serializes to and
/// deserializes from, and providing a mapping from variants to
/// expressions (such as libc consts or kernel header values) that
/// will ultimately be written to and read from the wire.
///
/// # Usage
///
/// ```
/// ovsdp::impl_var!(
///     /// Attributes of a fake generic netlink family
///     pub MyFamilyAttrs,
///     u16,
///     Id => 1u16,
///     Name => 2u16
/// );
///
/// assert_eq!(u16::from(MyFamilyAttrs::Name), 2);
/// assert_eq!(MyFamilyAttrs::from(7), MyFamilyAttrs::UnrecognizedVariant(7));
/// ```
#[macro_export]
macro_rules! impl_var {
    (
        $( #[$outer:meta] )*
        $vis:vis $name:ident, $ty:ty,
        $(
            $( #[cfg($meta:meta)] )*
            $var:ident => $val:expr
        ),*
    ) => (
        $(#[$outer])*
        #[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        $vis enum $name {
            $(
                $(
                    #[cfg($meta)]
                )*
                #[allow(missing_docs)]
                $var,
            )*
            /// Variant that signifies an invalid value while
            /// deserializing
            UnrecognizedVariant($ty),
        }

        impl $name {
            /// Returns true if no variant corresponds to the value
            /// it was parsed from
            pub fn is_unrecognized(&self) -> bool {
                matches!(*self, $name::UnrecognizedVariant(_))
            }
        }

        impl From<$ty> for $name {
            fn from(v: $ty) -> Self {
                match v {
                    $(
                        $(
                            #[cfg($meta)]
                        )*
                        i if i == $val => $name::$var,
                    )*
                    i => $name::UnrecognizedVariant(i)
                }
            }
        }

        impl From<$name> for $ty {
            fn from(v: $name) -> Self {
                match v {
                    $(
                        $(
                            #[cfg($meta)]
                        )*
                        $name::$var => $val,
                    )*
                    $name::UnrecognizedVariant(i) => i,
                }
            }
        }

        impl<'a> From<&'a $name> for $ty {
            fn from(v: &'a $name) -> Self {
                <$ty>::from(*v)
            }
        }
    );
}
