//! EC2 backend built on `aws-sdk-ec2`.
//!
//! The SDK owns request signing, credential loading, retries of throttled
//! calls and response decoding. This module maps the SDK's volume shapes and
//! error metadata onto [`crate::backend`].

mod error;

use std::str::FromStr;

use aws_config::BehaviorVersion;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::operation::create_volume::CreateVolumeOutput;
use aws_sdk_ec2::types::{
    self, EbsInstanceBlockDeviceSpecification, InstanceBlockDeviceMappingSpecification,
    ResourceType, TagSpecification, VolumeType,
};
use camino::Utf8Path;
use tracing::debug;

use crate::backend::{BackendFuture, CreateVolumeRequest, Tag, Volume, VolumeBackend, VolumeState};
use crate::request::VolumeClass;

pub use error::Ec2BackendError;

/// [`VolumeBackend`] backed by an `aws-sdk-ec2` client.
#[derive(Clone, Debug)]
pub struct Ec2Backend {
    client: Client,
}

impl Ec2Backend {
    /// Loads the default AWS configuration for `region` and builds a
    /// backend, talking to `endpoint` when given and the regional endpoint
    /// otherwise.
    ///
    /// Credentials come from the SDK's default provider chain: environment
    /// variables, shared profiles, web identity, the ECS container endpoint
    /// and the instance profile.
    ///
    /// # Errors
    ///
    /// Returns [`Ec2BackendError::Endpoint`] when `endpoint` is not an
    /// `http` or `https` URL.
    pub async fn load(region: &str, endpoint: Option<&str>) -> Result<Self, Ec2BackendError> {
        let override_url = endpoint.map(checked_endpoint).transpose()?;
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        let mut builder = aws_sdk_ec2::config::Builder::from(&sdk_config);
        if let Some(url) = override_url {
            builder = builder.endpoint_url(url);
        }
        Ok(Self::from_client(Client::from_conf(builder.build())))
    }

    /// Wraps a pre-configured client.
    #[must_use]
    pub const fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn create(&self, request: &CreateVolumeRequest) -> Result<Volume, Ec2BackendError> {
        const ACTION: &str = "CreateVolume";
        let size = sdk_int(ACTION, "size", request.size_gb)?;
        let iops = request
            .iops
            .map(|value| sdk_int(ACTION, "iops", value))
            .transpose()?;
        let tags = (!request.tags.is_empty()).then(|| {
            TagSpecification::builder()
                .resource_type(ResourceType::Volume)
                .set_tags(Some(request.tags.iter().map(sdk_tag).collect()))
                .build()
        });

        debug!(action = ACTION, zone = %request.availability_zone, "calling EC2");
        let output = self
            .client
            .create_volume()
            .availability_zone(&request.availability_zone)
            .size(size)
            .volume_type(VolumeType::from(request.class.as_str()))
            .set_iops(iops)
            .client_token(&request.client_token)
            .set_tag_specifications(tags.map(|spec| vec![spec]))
            .send()
            .await
            .map_err(|err| Ec2BackendError::from_sdk(ACTION, &err))?;
        VolumeFields::from(&output).into_volume(ACTION)
    }

    async fn describe(&self, volume_id: &str) -> Result<Volume, Ec2BackendError> {
        const ACTION: &str = "DescribeVolumes";
        debug!(action = ACTION, volume_id, "calling EC2");
        let output = self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|err| Ec2BackendError::from_sdk(ACTION, &err))?;
        let Some(volume) = output
            .volumes()
            .iter()
            .find(|volume| volume.volume_id() == Some(volume_id))
        else {
            return Err(Ec2BackendError::volume_not_found(ACTION, volume_id));
        };
        VolumeFields::from(volume).into_volume(ACTION)
    }

    async fn attach(
        &self,
        instance_id: &str,
        volume_id: &str,
        device: &Utf8Path,
    ) -> Result<(), Ec2BackendError> {
        const ACTION: &str = "AttachVolume";
        debug!(action = ACTION, volume_id, %device, "calling EC2");
        self.client
            .attach_volume()
            .instance_id(instance_id)
            .volume_id(volume_id)
            .device(device.as_str())
            .send()
            .await
            .map_err(|err| Ec2BackendError::from_sdk(ACTION, &err))?;
        Ok(())
    }

    async fn delete_on_termination(
        &self,
        instance_id: &str,
        device: &Utf8Path,
    ) -> Result<(), Ec2BackendError> {
        const ACTION: &str = "ModifyInstanceAttribute";
        let mapping = InstanceBlockDeviceMappingSpecification::builder()
            .device_name(device.as_str())
            .ebs(
                EbsInstanceBlockDeviceSpecification::builder()
                    .delete_on_termination(true)
                    .build(),
            )
            .build();
        debug!(action = ACTION, instance_id, %device, "calling EC2");
        self.client
            .modify_instance_attribute()
            .instance_id(instance_id)
            .block_device_mappings(mapping)
            .send()
            .await
            .map_err(|err| Ec2BackendError::from_sdk(ACTION, &err))?;
        Ok(())
    }

    async fn detach(&self, volume_id: &str, force: bool) -> Result<(), Ec2BackendError> {
        const ACTION: &str = "DetachVolume";
        debug!(action = ACTION, volume_id, force, "calling EC2");
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .force(force)
            .send()
            .await
            .map_err(|err| Ec2BackendError::from_sdk(ACTION, &err))?;
        Ok(())
    }

    async fn delete(&self, volume_id: &str) -> Result<(), Ec2BackendError> {
        const ACTION: &str = "DeleteVolume";
        debug!(action = ACTION, volume_id, "calling EC2");
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(|err| Ec2BackendError::from_sdk(ACTION, &err))?;
        Ok(())
    }
}

fn checked_endpoint(endpoint: &str) -> Result<String, Ec2BackendError> {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return Err(Ec2BackendError::Endpoint {
            endpoint: endpoint.to_owned(),
            message: String::from("expected an absolute http or https URL"),
        });
    };
    if !matches!(scheme, "http" | "https") {
        return Err(Ec2BackendError::Endpoint {
            endpoint: endpoint.to_owned(),
            message: format!("unsupported scheme '{scheme}'"),
        });
    }
    if rest.split('/').next().is_none_or(str::is_empty) {
        return Err(Ec2BackendError::Endpoint {
            endpoint: endpoint.to_owned(),
            message: String::from("endpoint has no host"),
        });
    }
    Ok(endpoint.to_owned())
}

fn sdk_int(action: &'static str, field: &str, value: u32) -> Result<i32, Ec2BackendError> {
    i32::try_from(value).map_err(|_| Ec2BackendError::Request {
        action,
        message: format!("{field} {value} is out of range"),
    })
}

fn sdk_tag(tag: &Tag) -> types::Tag {
    types::Tag::builder()
        .key(&tag.key)
        .value(&tag.value)
        .build()
}

/// Volume attributes shared by the create and describe responses.
struct VolumeFields<'a> {
    id: Option<&'a str>,
    state: Option<&'a str>,
    availability_zone: Option<&'a str>,
    volume_type: Option<&'a str>,
    size: Option<i32>,
    iops: Option<i32>,
}

impl<'a> From<&'a types::Volume> for VolumeFields<'a> {
    fn from(volume: &'a types::Volume) -> Self {
        Self {
            id: volume.volume_id(),
            state: volume.state().map(types::VolumeState::as_str),
            availability_zone: volume.availability_zone(),
            volume_type: volume.volume_type().map(VolumeType::as_str),
            size: volume.size(),
            iops: volume.iops(),
        }
    }
}

impl<'a> From<&'a CreateVolumeOutput> for VolumeFields<'a> {
    fn from(output: &'a CreateVolumeOutput) -> Self {
        Self {
            id: output.volume_id(),
            state: output.state().map(types::VolumeState::as_str),
            availability_zone: output.availability_zone(),
            volume_type: output.volume_type().map(VolumeType::as_str),
            size: output.size(),
            iops: output.iops(),
        }
    }
}

impl VolumeFields<'_> {
    fn into_volume(self, action: &'static str) -> Result<Volume, Ec2BackendError> {
        let malformed = |message: String| Ec2BackendError::Malformed { action, message };
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| malformed(String::from("volume id missing")))?;
        let raw_state = self.state.unwrap_or_default();
        let state = VolumeState::parse(raw_state)
            .ok_or_else(|| malformed(format!("unknown volume state '{raw_state}'")))?;
        let raw_type = self.volume_type.unwrap_or_default();
        let class = VolumeClass::from_str(raw_type)
            .map_err(|_| malformed(format!("unknown volume type '{raw_type}'")))?;
        let size_gb = self
            .size
            .and_then(|size| u32::try_from(size).ok())
            .ok_or_else(|| malformed(format!("invalid size {:?}", self.size)))?;
        Ok(Volume {
            id: id.to_owned(),
            state,
            availability_zone: self.availability_zone.unwrap_or_default().to_owned(),
            class,
            size_gb,
            iops: self.iops.and_then(|iops| u32::try_from(iops).ok()),
        })
    }
}

impl VolumeBackend for Ec2Backend {
    type Error = Ec2BackendError;

    fn create_volume<'a>(
        &'a self,
        request: &'a CreateVolumeRequest,
    ) -> BackendFuture<'a, Volume, Self::Error> {
        Box::pin(self.create(request))
    }

    fn describe_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, Volume, Self::Error> {
        Box::pin(self.describe(volume_id))
    }

    fn attach_volume<'a>(
        &'a self,
        instance_id: &'a str,
        volume_id: &'a str,
        device: &'a Utf8Path,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.attach(instance_id, volume_id, device))
    }

    fn set_delete_on_termination<'a>(
        &'a self,
        instance_id: &'a str,
        device: &'a Utf8Path,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.delete_on_termination(instance_id, device))
    }

    fn detach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        force: bool,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.detach(volume_id, force))
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(self.delete(volume_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn fields<'a>(state: Option<&'a str>, volume_type: Option<&'a str>) -> VolumeFields<'a> {
        VolumeFields {
            id: Some("vol-1"),
            state,
            availability_zone: Some("us-east-1a"),
            volume_type,
            size: Some(100),
            iops: Some(4_500),
        }
    }

    #[test]
    fn volume_fields_map_onto_a_volume() {
        let volume = fields(Some("in-use"), Some("io1"))
            .into_volume("DescribeVolumes")
            .expect("volume maps");

        assert_eq!(volume.id, "vol-1");
        assert_eq!(volume.state, VolumeState::InUse);
        assert_eq!(volume.class, VolumeClass::ProvisionedIops);
        assert_eq!(volume.size_gb, 100);
        assert_eq!(volume.iops, Some(4_500));
    }

    #[rstest]
    #[case::state(Some("rebooting"), Some("gp2"), "unknown volume state")]
    #[case::missing_state(None, Some("gp2"), "unknown volume state")]
    #[case::class(Some("available"), Some("gp3"), "unknown volume type 'gp3'")]
    fn unknown_values_are_malformed(
        #[case] state: Option<&str>,
        #[case] volume_type: Option<&str>,
        #[case] expected: &str,
    ) {
        let err = fields(state, volume_type)
            .into_volume("CreateVolume")
            .expect_err("value is not representable");

        assert!(matches!(err, Ec2BackendError::Malformed { .. }), "{err:?}");
        assert!(err.to_string().contains(expected), "{err}");
    }

    #[test]
    fn sdk_volume_shape_is_read() {
        let volume = types::Volume::builder()
            .volume_id("vol-2")
            .state(types::VolumeState::Available)
            .availability_zone("eu-west-1b")
            .volume_type(VolumeType::St1)
            .size(500)
            .build();

        let mapped = VolumeFields::from(&volume)
            .into_volume("DescribeVolumes")
            .expect("volume maps");

        assert_eq!(mapped.state, VolumeState::Available);
        assert_eq!(mapped.class, VolumeClass::ThroughputOptimized);
        assert_eq!(mapped.iops, None);
    }

    #[rstest]
    #[case("http://127.0.0.1:4566")]
    #[case("https://ec2.us-east-1.amazonaws.com")]
    fn http_endpoints_are_accepted(#[case] endpoint: &str) {
        assert_eq!(checked_endpoint(endpoint).ok().as_deref(), Some(endpoint));
    }

    #[rstest]
    #[case("ec2.us-east-1.amazonaws.com")]
    #[case("unix:///tmp/socket")]
    #[case("http:///path-only")]
    fn unusable_endpoints_are_rejected(#[case] endpoint: &str) {
        let result = checked_endpoint(endpoint);
        assert!(matches!(result, Err(Ec2BackendError::Endpoint { .. })), "{result:?}");
    }

    #[test]
    fn oversized_values_are_refused_before_sending() {
        let err = sdk_int("CreateVolume", "size", u32::MAX).expect_err("out of range");
        assert!(err.to_string().contains("size"), "{err}");
    }
}
