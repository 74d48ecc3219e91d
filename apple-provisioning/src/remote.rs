// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote authority issuing certificates and provisioning profiles.

use {
    crate::{
        AssetSource, CertificateClass, Entitlements, Platform, ProfileType, ProvisioningError,
        ProvisioningProfile, SigningCertificate,
    },
    log::warn,
    std::time::Duration,
};

/// A device registered with the remote authority.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    /// Remote resource id.
    pub id: String,
    pub udid: String,
    pub name: String,
    pub platform: Option<String>,
    pub status: Option<String>,
}

/// What a profile created or regenerated remotely should contain.
#[derive(Clone, Debug)]
pub struct ProfileRequest {
    pub name: String,
    pub profile_type: ProfileType,
    /// Bundle identifier, possibly a wildcard.
    pub bundle_id: String,
    pub entitlements: Entitlements,
    /// Remote ids of certificates to embed.
    pub certificate_ids: Vec<String>,
    /// UDIDs of devices to provision. Must already be registered.
    pub device_udids: Vec<String>,
}

/// Narrows a profile listing.
#[derive(Clone, Debug, Default)]
pub struct ProfileFilter {
    pub name: Option<String>,
    pub profile_type: Option<ProfileType>,
}

/// Operations against the remote certificate, profile and device registry.
///
/// Listing operations may be retried by implementations. Mutating operations
/// are attempted once.
pub trait RemoteProvisioningClient {
    /// Create a certificate of a class.
    ///
    /// The returned certificate holds its private key.
    fn create_certificate(
        &self,
        class: CertificateClass,
    ) -> Result<SigningCertificate, ProvisioningError>;

    fn create_profile(
        &self,
        request: &ProfileRequest,
    ) -> Result<ProvisioningProfile, ProvisioningError>;

    /// Bring an existing profile in line with a request.
    ///
    /// The profile may be regenerated, in which case its UUID changes.
    fn update_profile(
        &self,
        profile_id: &str,
        request: &ProfileRequest,
    ) -> Result<ProvisioningProfile, ProvisioningError>;

    fn register_device(&self, udid: &str, platform: Platform) -> Result<Device, ProvisioningError>;

    /// Remote id of the app id registered for an exact bundle identifier.
    fn find_bundle_id(&self, identifier: &str) -> Result<Option<String>, ProvisioningError>;

    fn list_certificates(
        &self,
        class: Option<CertificateClass>,
    ) -> Result<Vec<SigningCertificate>, ProvisioningError>;

    fn list_profiles(
        &self,
        filter: &ProfileFilter,
    ) -> Result<Vec<ProvisioningProfile>, ProvisioningError>;

    fn list_devices(&self, platform: Platform) -> Result<Vec<Device>, ProvisioningError>;

    fn delete_profile(&self, profile_id: &str) -> Result<(), ProvisioningError>;
}

/// Presents a remote listing as an [AssetSource].
pub struct RemoteAssetSource<'a> {
    client: &'a dyn RemoteProvisioningClient,
    class: Option<CertificateClass>,
    filter: ProfileFilter,
}

impl<'a> RemoteAssetSource<'a> {
    pub fn new(
        client: &'a dyn RemoteProvisioningClient,
        class: Option<CertificateClass>,
        filter: ProfileFilter,
    ) -> Self {
        Self {
            client,
            class,
            filter,
        }
    }
}

impl<'a> AssetSource for RemoteAssetSource<'a> {
    fn list_certificates(&self) -> Result<Vec<SigningCertificate>, ProvisioningError> {
        self.client.list_certificates(self.class)
    }

    fn list_profiles(&self) -> Result<Vec<ProvisioningProfile>, ProvisioningError> {
        self.client.list_profiles(&self.filter)
    }
}

/// Failure of one attempt of a retryable operation.
#[derive(Debug)]
pub enum AttemptError {
    /// Another attempt may succeed, optionally after a server requested delay.
    Transient(ProvisioningError, Option<Duration>),
    Permanent(ProvisioningError),
}

/// Bounded retries with exponential backoff.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubled for each further attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy making a single attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    /// Whether an HTTP status warrants another attempt.
    pub fn is_retryable_status(status: u16) -> bool {
        status == 401 || status == 429 || status >= 500
    }

    /// Run an operation until it succeeds, fails permanently or attempts run out.
    ///
    /// `sleep` is called between attempts.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, AttemptError>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, ProvisioningError> {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(AttemptError::Permanent(e)) => return Err(e),
                Err(AttemptError::Transient(e, _)) if attempt >= max_attempts => return Err(e),
                Err(AttemptError::Transient(e, retry_after)) => {
                    let wait = retry_after.unwrap_or(delay);
                    warn!(
                        "attempt {} of {} failed: {}; retrying in {}s",
                        attempt,
                        max_attempts,
                        e,
                        wait.as_secs()
                    );
                    sleep(wait);

                    delay = delay.checked_mul(2).unwrap_or(Duration::MAX);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient(status: u16) -> AttemptError {
        AttemptError::Transient(
            ProvisioningError::RemoteApi {
                status,
                message: "try again".into(),
            },
            None,
        )
    }

    #[test]
    fn retries_stop_at_cap() {
        let mut calls = 0;
        let mut sleeps = vec![];

        let res: Result<(), _> = RetryPolicy::default().run(
            || {
                calls += 1;
                Err(transient(503))
            },
            |d| sleeps.push(d),
        );

        assert!(matches!(
            res,
            Err(ProvisioningError::RemoteApi { status: 503, .. })
        ));
        assert_eq!(calls, 3);
        assert_eq!(sleeps, vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[test]
    fn backoff_saturates() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff: Duration::MAX / 2 + Duration::from_secs(1),
        };
        let mut sleeps = vec![];

        let res: Result<(), _> = policy.run(|| Err(transient(500)), |d| sleeps.push(d));

        assert!(res.is_err());
        assert_eq!(sleeps, vec![policy.backoff, Duration::MAX, Duration::MAX]);
    }

    #[test]
    fn retry_after_and_success() {
        let mut calls = 0;
        let mut sleeps = vec![];

        let res = RetryPolicy::default().run(
            || {
                calls += 1;
                if calls == 1 {
                    Err(AttemptError::Transient(
                        ProvisioningError::RemoteApi {
                            status: 429,
                            message: "slow down".into(),
                        },
                        Some(Duration::from_secs(7)),
                    ))
                } else {
                    Ok(calls)
                }
            },
            |d| sleeps.push(d),
        );

        assert_eq!(res.unwrap(), 2);
        assert_eq!(sleeps, vec![Duration::from_secs(7)]);
    }

    #[test]
    fn permanent_errors_and_single_attempts() {
        let mut calls = 0;
        let res: Result<(), _> = RetryPolicy::default().run(
            || {
                calls += 1;
                Err(AttemptError::Permanent(ProvisioningError::RemoteApi {
                    status: 409,
                    message: "conflict".into(),
                }))
            },
            |_| {},
        );
        assert!(res.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let res: Result<(), _> = RetryPolicy::once().run(
            || {
                calls += 1;
                Err(transient(500))
            },
            |_| panic!("no sleep expected"),
        );
        assert!(res.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn retryable_statuses() {
        for status in [401, 429, 500, 502, 503] {
            assert!(RetryPolicy::is_retryable_status(status));
        }
        for status in [400, 403, 404, 409] {
            assert!(!RetryPolicy::is_retryable_status(status));
        }
    }
}
