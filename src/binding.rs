//! Queue and exchange declaration on an open connection.
//!
//! Declarations are idempotent: repeating one with the same shape is a no-op,
//! while a different shape under the same name fails with
//! [`Error::BindingConflict`](crate::Error::BindingConflict).

use crate::error::Result;
use crate::transport::Connection;
use crate::{validate_name, ExchangeDeclaration, QueueBinding};
use tracing::{debug, error};

/// Declare a queue and bind it to its exchange, if it names one
pub fn declare(connection: &mut Connection, binding: &QueueBinding) -> Result<()> {
    validate_name(&binding.name)?;
    connection.declare_queue(binding)?;

    if let Some(exchange) = &binding.exchange {
        validate_name(exchange)?;
        let routing_key = binding.effective_routing_key();
        connection.bind_queue(&binding.name, exchange, routing_key)?;
        debug!(
            "Queue '{}' bound to exchange '{}' with key {}",
            binding.name, exchange, routing_key
        );
    } else {
        debug!("Queue '{}' declared", binding.name);
    }
    Ok(())
}

pub fn declare_exchange(connection: &mut Connection, exchange: &ExchangeDeclaration) -> Result<()> {
    validate_name(&exchange.name)?;
    connection.declare_exchange(exchange)?;
    debug!("Exchange '{}' declared", exchange.name);
    Ok(())
}

/// Declare bindings in order, stopping at the first failure.
///
/// Queues declared before the failure stay declared.
pub fn bind_all(connection: &mut Connection, bindings: &[QueueBinding]) -> Result<()> {
    for (index, binding) in bindings.iter().enumerate() {
        if let Err(e) = declare(connection, binding) {
            error!(
                "Declaring '{}' failed after {} of {} bindings: {}",
                binding.name,
                index,
                bindings.len(),
                e
            );
            return Err(e);
        }
    }
    Ok(())
}
