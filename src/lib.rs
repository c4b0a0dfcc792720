//! # dyntype
//!
//! A dynamic runtime type system: register type descriptors at run time,
//! build single-allocation objects whose layout follows the descriptor
//! inheritance chain, and attach per-type plugin sub-structures that are
//! co-allocated, co-initialized, co-copied and co-destroyed with the
//! object.
//!
//! Typical consumers are scripting-engine bridges, document object models
//! and game-world entity systems: one process needs a closed universe of
//! richly inheriting types without compile-time class definitions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TYPE SYSTEM                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Registry   │  │    Layout    │  │  Lifecycle   │          │
//! │  │ (system.rs)  │  │ (system.rs)  │  │ (system.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Descriptors │  │   Plugins    │  │   Payloads   │          │
//! │  │(descriptor.rs│  │ (plugin.rs)  │  │ (payload.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐                             │
//! │  │ Lock adapter │  │  Allocator   │                             │
//! │  │  (lock.rs)   │  │  (alloc.rs)  │                             │
//! │  └──────────────┘  └──────────────┘                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Object layout
//!
//! Every object is one contiguous allocation:
//!
//! ```text
//! [ header | payload | plugin block of root ancestor | … | plugin block of leaf ]
//! ```
//!
//! Plugin blocks are constructed root-first and destroyed leaf-first;
//! this ordering is the sole layout contract plugins may depend on.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dyntype::{TypeSystem, TypedPayload, TypeResult, Host, Params};
//!
//! struct Health(u32);
//!
//! impl TypedPayload for Health {
//!     fn construct(_host: Host<'_>, _params: Params<'_>) -> TypeResult<Self> {
//!         Ok(Health(100))
//!     }
//! }
//!
//! let sys = TypeSystem::new();
//! let actor = sys.register_struct_type::<Health>("Actor", None)?;
//! sys.register_struct_plugin::<u64>(actor)?;
//!
//! let object = sys.construct(None, actor, None)?;
//! // ... use the object ...
//! unsafe { sys.destroy(None, object)? };
//! # Ok::<(), dyntype::TypeError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod descriptor;
pub mod error;
pub mod lock;
pub mod object;
pub mod payload;
pub mod plugin;
pub mod system;

// Re-exports
pub use alloc::{AllocationStats, MemoryAllocator, SystemAllocator};
pub use descriptor::TypeId;
pub use error::{TypeError, TypeResult};
pub use lock::{LockProvider, NoopLockProvider, RwLockProvider, ShareableLocks};
pub use object::{header_size, ObjectHeader, ObjectRef};
pub use payload::{
    AbstractPayload, DynamicStructPayload, Host, Params, PayloadInterface, SizeMeta,
    StructPayload, TypedPayload,
};
pub use plugin::{
    PluginId, PluginInterface, PluginOffset, PluginRegistry, PluginView, StructPlugin,
    ANONYMOUS_PLUGIN_ID, INVALID_PLUGIN_OFFSET,
};
pub use system::{
    SharedTypeSystem, TypeIter, TypeSystem, TypeSystemBuilder, STANDARD_OBJECT_ALIGNMENT,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
