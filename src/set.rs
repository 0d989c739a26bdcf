//! Ordered collections of live connections.

use std::slice;

use tracing::debug;

use crate::tunnel::Connection;

/// An ordered group of connections, disconnected together.
///
/// Connections keep the order they were opened in: blade types in catalog
/// order, instances ascending within each type. Dropping the set disconnects
/// every member.
#[derive(Debug)]
pub struct ConnectionSet<C: Connection> {
    connections: Vec<C>,
}

impl<C: Connection> ConnectionSet<C> {
    /// Wraps already-established connections.
    #[must_use]
    pub const fn new(connections: Vec<C>) -> Self {
        Self { connections }
    }

    /// Members whose blade type is `blade_type`, or all members for `None`.
    #[must_use]
    pub fn list_connections(&self, blade_type: Option<&str>) -> Vec<&C> {
        self.connections
            .iter()
            .filter(|connection| blade_type.is_none_or(|wanted| connection.blade_type() == wanted))
            .collect()
    }

    /// The member connected to `hostname`, if any.
    #[must_use]
    pub fn get_connection(&self, hostname: &str) -> Option<&C> {
        self.connections
            .iter()
            .find(|connection| connection.hostname() == hostname)
    }

    /// Iterates over every member in order.
    pub fn iter(&self) -> slice::Iter<'_, C> {
        self.connections.iter()
    }

    /// Number of members.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the set has no members.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Disconnects every member. Safe to call more than once.
    pub fn disconnect_all(&mut self) {
        debug!(members = self.connections.len(), "disconnecting connection set");
        for connection in &mut self.connections {
            connection.disconnect();
        }
    }
}

impl<'a, C: Connection> IntoIterator for &'a ConnectionSet<C> {
    type Item = &'a C;
    type IntoIter = slice::Iter<'a, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<C: Connection> Drop for ConnectionSet<C> {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}
