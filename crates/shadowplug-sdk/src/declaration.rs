//! Export table a plugin binary publishes to the host

use crate::guard::{Guarded, GuardedPlugin, contain};
use crate::{Plugin, PluginResult};

/// Version of the declaration layout and the [`GuardedPlugin`] vtable shape.
///
/// Bump whenever either changes; the host refuses binaries built against a
/// different value.
pub const API_VERSION: u32 = 2;

/// SDK version the binary was compiled against
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the exported [`PluginDeclaration`] static, NUL-terminated for symbol lookup
pub const DECLARATION_SYMBOL: &[u8] = b"shadowplug_declaration\0";

type Constructor = fn() -> PluginResult<Box<dyn Plugin>>;
type Guard = fn(&'static str, Constructor) -> PluginResult<Box<dyn GuardedPlugin>>;

/// A named constructor for one plugin type.
///
/// Both function pointers are taken inside the binary that declares the type,
/// so construction and the panic guard run on that binary's runtime.
#[derive(Clone)]
pub struct TypeDescriptor {
    type_name: &'static str,
    construct: Constructor,
    guard: Guard,
}

impl TypeDescriptor {
    /// Descriptor for a type built through its `Default` impl
    pub fn of<T>() -> Self
    where
        T: Plugin + Default + 'static,
    {
        Self {
            type_name: std::any::type_name::<T>(),
            construct: construct_default::<T>,
            guard: construct_guarded,
        }
    }

    /// Descriptor for a type whose constructor may fail
    pub fn fallible(type_name: &'static str, construct: Constructor) -> Self {
        Self {
            type_name,
            construct,
            guard: construct_guarded,
        }
    }

    /// Fully qualified Rust type name
    pub fn type_name(&self) -> &str {
        self.type_name
    }

    /// Create a fresh, guarded instance
    pub fn instantiate(&self) -> PluginResult<Box<dyn GuardedPlugin>> {
        (self.guard)(self.type_name, self.construct)
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

fn construct_default<T>() -> PluginResult<Box<dyn Plugin>>
where
    T: Plugin + Default + 'static,
{
    Ok(Box::new(T::default()))
}

fn construct_guarded(
    type_name: &'static str,
    construct: Constructor,
) -> PluginResult<Box<dyn GuardedPlugin>> {
    let plugin = contain(construct)??;
    Ok(Box::new(Guarded::new(type_name, plugin)))
}

/// Sink the host hands to a binary's registration function
pub trait PluginRegistrar {
    /// Record one plugin type
    fn register(&mut self, ty: TypeDescriptor);
}

impl PluginRegistrar for Vec<TypeDescriptor> {
    fn register(&mut self, ty: TypeDescriptor) {
        self.push(ty);
    }
}

/// Declaration exported by every plugin binary.
///
/// `api_version` sits first in a `repr(C)` layout so the host can read it
/// before trusting anything else in the table.
#[repr(C)]
pub struct PluginDeclaration {
    pub api_version: u32,
    pub sdk_version: &'static str,
    /// Registers every declared type; panics are caught inside the binary
    pub register: fn(&mut dyn PluginRegistrar) -> PluginResult<()>,
}

impl PluginDeclaration {
    /// Run the registration function and collect every declared type
    pub fn collect(&self) -> PluginResult<Vec<TypeDescriptor>> {
        let mut types = Vec::new();
        (self.register)(&mut types)?;
        Ok(types)
    }
}

/// Macro to export the plugin declaration for one or more plugin types
///
/// Every listed type must implement [`Plugin`] and `Default`; anything else is
/// rejected at compile time.
#[macro_export]
macro_rules! declare_plugin {
    ($($plugin_type:ty),+ $(,)?) => {
        fn __shadowplug_register(
            registrar: &mut dyn $crate::PluginRegistrar,
        ) -> $crate::PluginResult<()> {
            $crate::contain(|| {
                $(
                    registrar.register($crate::TypeDescriptor::of::<$plugin_type>());
                )+
            })
        }

        #[unsafe(no_mangle)]
        #[allow(non_upper_case_globals)]
        pub static shadowplug_declaration: $crate::PluginDeclaration = $crate::PluginDeclaration {
            api_version: $crate::API_VERSION,
            sdk_version: $crate::SDK_VERSION,
            register: __shadowplug_register,
        };
    };
}
