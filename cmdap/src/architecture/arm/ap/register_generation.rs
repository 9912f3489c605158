//! Helper macros to define access port registers.

/// Defines a new typed access port register.
/// Takes
/// - name: The name of the constructed type for the register. Also accepts a doc comment to be added to the type.
/// - address: The full 8-bit address of the register, bank included.
/// - fields: A list of fields of the register type.
/// - from: an expression to transform from an `u32` to the typed register.
/// - to: An expression to transform from the typed register to an `u32`.
macro_rules! define_ap_register {
    (
        $(#[$outer:meta])*
        name: $name:ident,
        address: $address:expr,
        fields: [$($(#[$inner:meta])*$field:ident: $type:ty$(,)?)*],
        from: $from_param:ident => $from:expr,
        to: $to_param:ident => $to:expr
    )
    => {
        $(#[$outer])*
        #[allow(clippy::upper_case_acronyms)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            $($(#[$inner])*pub $field: $type,)*
        }

        impl $crate::architecture::arm::Register for $name {
            const ADDRESS: u8 = $address;
            const NAME: &'static str = stringify!($name);
        }

        impl From<u32> for $name {
            fn from($from_param: u32) -> $name {
                $from
            }
        }

        impl From<$name> for u32 {
            fn from($to_param: $name) -> u32 {
                $to
            }
        }
    }
}
