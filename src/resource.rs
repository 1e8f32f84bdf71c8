//! Capability traits shared by the managed resource kinds.

/// A resource with a human-assigned name, unique within its kind.
pub trait Named {
    fn name(&self) -> &str;
}

/// A resource with a provider-assigned canonical identifier, immutable once
/// set.
pub trait RemoteResource: Named {
    fn remote_id(&self) -> &str;
}
