//! Consumer reachability probing.

use crate::error::Result;

/// Checks whether a consumer address can currently be reached.
///
/// Ordinary unreachability is `Ok(false)`. `Err` is reserved for local
/// failures of the probe itself; the reaper counts both the same way.
pub trait LivenessProber: Send + Sync {
    fn is_reachable(&self, address: &str) -> Result<bool>;
}

/// Adapts a closure into a prober.
pub struct FnProber<F>(pub F);

impl<F> FnProber<F>
where
    F: Fn(&str) -> Result<bool> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnProber(f)
    }
}

impl<F> LivenessProber for FnProber<F>
where
    F: Fn(&str) -> Result<bool> + Send + Sync,
{
    fn is_reachable(&self, address: &str) -> Result<bool> {
        (self.0)(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;

    #[test]
    fn test_fn_prober() {
        let prober = FnProber::new(|address| match address {
            "up" => Ok(true),
            "down" => Ok(false),
            _ => Err(RegistryError::Probe("no route".into())),
        });

        assert!(prober.is_reachable("up").unwrap());
        assert!(!prober.is_reachable("down").unwrap());
        assert!(prober.is_reachable("other").is_err());
    }
}
