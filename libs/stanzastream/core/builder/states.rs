/// Type-state markers for the configuration builder
///
/// These types track at compile time whether the server address has
/// been set, so a configuration without an address cannot be built.
use std::marker::PhantomData;

/// Marker trait for address state
pub trait AddressState {}

/// Address has not been set
pub struct NoAddress;
impl AddressState for NoAddress {}

/// Address has been set
pub struct HasAddress;
impl AddressState for HasAddress {}

/// Phantom marker to prevent direct construction
#[derive(Debug, Clone, Copy)]
pub struct TypeState<A> {
    _address: PhantomData<A>,
}

impl<A> TypeState<A> {
    pub(crate) fn new() -> Self {
        Self {
            _address: PhantomData,
        }
    }
}

impl<A> Default for TypeState<A> {
    fn default() -> Self {
        Self::new()
    }
}
