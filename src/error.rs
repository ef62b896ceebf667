// Renderer error type
//
// Internals propagate `anyhow::Error` with context. At the public boundary
// everything is folded into `RendererError`, keeping the typed variants that
// were raised deeper down.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by the renderer's public operations.
#[derive(Error, Debug)]
pub enum RendererError {
    /// No physical device satisfies the graphics/present/extension requirements
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// A compiled shader could not be read or is not valid SPIR-V
    #[error("Failed to read shader {path:?}: {source}")]
    ShaderReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An operation that needs a started renderer was called before `startup`
    #[error("Renderer is not started")]
    NotStarted,

    /// A fence wait or image acquire exceeded the configured frame timeout
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// Any other Vulkan or setup failure
    #[error("Renderer failure: {0:#}")]
    Failure(anyhow::Error),
}

impl From<anyhow::Error> for RendererError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RendererError>() {
            Ok(typed) => typed,
            Err(err) => RendererError::Failure(err),
        }
    }
}

impl From<ash::vk::Result> for RendererError {
    fn from(result: ash::vk::Result) -> Self {
        match result {
            ash::vk::Result::TIMEOUT => RendererError::Timeout,
            other => RendererError::Failure(other.into()),
        }
    }
}

pub type RendererResult<T> = std::result::Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_errors_survive_anyhow_round_trip() {
        let err: anyhow::Error = RendererError::NoSuitableDevice.into();
        assert!(matches!(RendererError::from(err), RendererError::NoSuitableDevice));
    }

    #[test]
    fn context_wrapped_typed_error_is_still_recovered() {
        let result: anyhow::Result<()> =
            Err(anyhow::Error::new(RendererError::NoSuitableDevice)).context("picking GPU");
        let err = RendererError::from(result.unwrap_err());
        assert!(matches!(err, RendererError::NoSuitableDevice));
    }

    #[test]
    fn untyped_errors_become_failure() {
        let err = RendererError::from(anyhow::anyhow!("boom"));
        assert!(matches!(err, RendererError::Failure(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn vk_timeout_maps_to_timeout() {
        assert!(matches!(
            RendererError::from(ash::vk::Result::TIMEOUT),
            RendererError::Timeout
        ));
        assert!(matches!(
            RendererError::from(ash::vk::Result::ERROR_DEVICE_LOST),
            RendererError::Failure(_)
        ));
    }
}
