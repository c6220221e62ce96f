//! Profile operations

use reqwest::Method;
use tracing::debug;

use super::types::{ProfilePut, ProfilesPost};
use super::Client;
use crate::error::{Error, Result};

impl Client {
    /// Create a profile if it does not already exist.
    ///
    /// A project that forbids privileged containers rejects the kubeadm
    /// profile outright; that is surfaced as a terminal permission error so
    /// the reconciler stops retrying.
    pub async fn init_profile(&self, name: &str, profile: &ProfilePut) -> Result<()> {
        let body = serde_json::to_value(ProfilesPost {
            name: name.to_string(),
            profile: profile.clone(),
        })?;

        match self
            .call(Method::POST, "/1.0/profiles", &[], Some(body), "CreateProfile")
            .await
        {
            Ok(_) => {
                debug!("Created profile {name}");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("Profile {name} already exists");
                Ok(())
            }
            Err(Error::IncusApi { operation, message })
                if message.contains("Privileged containers are forbidden") =>
            {
                Err(Error::Forbidden { operation, message })
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a profile if it exists.
    pub async fn delete_profile(&self, name: &str) -> Result<()> {
        match self
            .call(
                Method::DELETE,
                &format!("/1.0/profiles/{name}"),
                &[],
                None,
                "DeleteProfile",
            )
            .await
        {
            Ok(_) => {
                debug!("Removed profile {name}");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Profile {name} does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
