//! Identifier types used by the proxy.

use crate::define_id;

define_id!(
    /// Identity of one accepted client connection; keys the session registry.
    ClientId,
    "client"
);

define_id!(
    /// Identity of one backend-side connection of a session.
    ///
    /// A session gets a new link on every transfer, so events arriving from a
    /// retired link can be recognised and ignored.
    LinkId,
    "link"
);
