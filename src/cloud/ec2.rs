use chrono::Utc;
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::sigv4::{self, SignableRequest};
use super::xml::{self, Element};
use super::{
    BlockDeviceMapping, CloudApi, CloudError, CreateSnapshotRequest, CreateVolumeRequest,
    CredentialProvider, Instance, Snapshot, Tag, Volume, VolumeAttachment,
};

const API_VERSION: &str = "2016-11-15";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

pub struct Ec2Client {
    http: Client,
    region: String,
    host: String,
    endpoint: String,
    credentials: CredentialProvider,
}

/// Ordered Query API parameters.
#[derive(Debug, Default)]
struct Params(Vec<(String, String)>);

impl Params {
    fn new(action: &str) -> Self {
        let mut params = Self::default();
        params.set("Action", action);
        params.set("Version", API_VERSION);
        params
    }

    fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((key.into(), value.into()));
        self
    }

    /// `TagSpecification.1.*` so the resource is born tagged.
    fn tag_specification(&mut self, resource_type: &str, tags: &[Tag]) -> &mut Self {
        if tags.is_empty() {
            return self;
        }
        self.set("TagSpecification.1.ResourceType", resource_type);
        for (i, tag) in tags.iter().enumerate() {
            let n = i + 1;
            self.set(format!("TagSpecification.1.Tag.{n}.Key"), &tag.key);
            self.set(format!("TagSpecification.1.Tag.{n}.Value"), &tag.value);
        }
        self
    }

    fn action(&self) -> &str {
        self.0
            .first()
            .map(|(_, v)| v.as_str())
            .unwrap_or("unknown")
    }
}

impl Ec2Client {
    pub fn new(region: &str, credentials: CredentialProvider) -> Result<Self, CloudError> {
        let host = format!("ec2.{}.amazonaws.com", region);
        Self::with_endpoint(region, &format!("https://{}/", host), credentials)
    }

    pub fn with_endpoint(
        region: &str,
        endpoint: &str,
        credentials: CredentialProvider,
    ) -> Result<Self, CloudError> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| CloudError::parse("client", format!("bad endpoint {endpoint}: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(CloudError::parse(
                    "client",
                    format!("endpoint {endpoint} has no host"),
                ));
            }
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| CloudError::Transport {
                action: "client".into(),
                source,
            })?;
        Ok(Self {
            http,
            region: region.to_string(),
            host,
            endpoint: endpoint.to_string(),
            credentials,
        })
    }

    fn call(&self, params: &Params) -> Result<Element, CloudError> {
        let action = params.action().to_string();
        let body = sigv4::form_body(&params.0);
        let credentials = self.credentials.current()?;

        let signed = sigv4::sign(
            SignableRequest {
                method: "POST",
                path: "/",
                query: "",
                headers: vec![("content-type".to_string(), CONTENT_TYPE.to_string())],
                payload: body.as_bytes(),
            },
            &self.host,
            &credentials,
            &self.region,
            "ec2",
            Utc::now(),
        );

        debug!(%action, "ec2 request");
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("content-type", CONTENT_TYPE);
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .map_err(|source| CloudError::Transport {
                action: action.clone(),
                source,
            })?;
        let status = response.status();
        let text = response.text().map_err(|source| CloudError::Transport {
            action: action.clone(),
            source,
        })?;

        match xml::parse(&text) {
            Ok(document) if status.is_success() => Ok(document),
            Ok(document) => Err(api_error(&action, status.as_u16(), &document)),
            Err(_) if !status.is_success() => Err(CloudError::Api {
                action,
                code: format!("HTTP{}", status.as_u16()),
                message: text.chars().take(200).collect(),
            }),
            Err(e) => Err(CloudError::parse(&action, e.to_string())),
        }
    }
}

fn api_error(action: &str, status: u16, document: &Element) -> CloudError {
    let error = document.path(&["Errors", "Error"]);
    CloudError::Api {
        action: action.to_string(),
        code: error
            .and_then(|e| e.text("Code"))
            .unwrap_or_else(|| format!("HTTP{status}")),
        message: error.and_then(|e| e.text("Message")).unwrap_or_default(),
    }
}

fn required(action: &str, element: &Element, name: &str) -> Result<String, CloudError> {
    element
        .text(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CloudError::parse(action, format!("missing <{name}> in <{}>", element.name)))
}

fn optional(element: &Element, name: &str) -> Option<String> {
    element.text(name).filter(|v| !v.is_empty())
}

fn parse_tags(element: &Element) -> Vec<Tag> {
    element
        .items("tagSet")
        .filter_map(|t| Some(Tag::new(t.text("key")?, t.text("value").unwrap_or_default())))
        .collect()
}

fn parse_instance(action: &str, item: &Element) -> Result<Instance, CloudError> {
    let state = item
        .path(&["instanceState", "name"])
        .map(Element::value)
        .ok_or_else(|| CloudError::parse(action, "missing instance state"))?;

    let block_devices = item
        .items("blockDeviceMapping")
        .map(|m| {
            Ok(BlockDeviceMapping {
                device_name: required(action, m, "deviceName")?,
                volume_id: m.child("ebs").and_then(|e| optional(e, "volumeId")),
            })
        })
        .collect::<Result<Vec<_>, CloudError>>()?;

    Ok(Instance {
        instance_id: required(action, item, "instanceId")?,
        state,
        root_device_name: optional(item, "rootDeviceName"),
        block_devices,
        tags: parse_tags(item),
    })
}

fn parse_volume(action: &str, item: &Element) -> Result<Volume, CloudError> {
    let size = required(action, item, "size")?;
    let size_gib = size
        .parse()
        .map_err(|_| CloudError::parse(action, format!("bad volume size {size:?}")))?;

    let attachments = item
        .items("attachmentSet")
        .map(|a| {
            Ok(VolumeAttachment {
                instance_id: required(action, a, "instanceId")?,
                device: required(action, a, "device")?,
                state: required(action, a, "status")?,
            })
        })
        .collect::<Result<Vec<_>, CloudError>>()?;

    Ok(Volume {
        volume_id: required(action, item, "volumeId")?,
        availability_zone: required(action, item, "availabilityZone")?,
        encrypted: optional(item, "encrypted").as_deref() == Some("true"),
        kms_key_id: optional(item, "kmsKeyId"),
        volume_type: required(action, item, "volumeType")?,
        iops: optional(item, "iops").and_then(|v| v.parse().ok()),
        throughput: optional(item, "throughput").and_then(|v| v.parse().ok()),
        size_gib,
        state: required(action, item, "status")?,
        attachments,
        tags: parse_tags(item),
    })
}

impl CloudApi for Ec2Client {
    fn describe_instance(&self, instance_id: &str) -> Result<Option<Instance>, CloudError> {
        let action = "DescribeInstances";
        let mut params = Params::new(action);
        params.set("InstanceId.1", instance_id);
        let document = self.call(&params)?;

        let instance = document
            .items("reservationSet")
            .flat_map(|r| r.items("instancesSet"))
            .next();
        instance.map(|i| parse_instance(action, i)).transpose()
    }

    fn describe_volume(&self, volume_id: &str) -> Result<Volume, CloudError> {
        let action = "DescribeVolumes";
        let mut params = Params::new(action);
        params.set("VolumeId.1", volume_id);
        let document = self.call(&params)?;

        let item = document
            .items("volumeSet")
            .next()
            .ok_or_else(|| CloudError::parse(action, format!("volume {volume_id} not returned")))?;
        parse_volume(action, item)
    }

    fn describe_volume_status(&self, volume_id: &str) -> Result<Option<String>, CloudError> {
        let action = "DescribeVolumeStatus";
        let mut params = Params::new(action);
        params.set("VolumeId.1", volume_id);
        let document = self.call(&params)?;

        Ok(document
            .items("volumeStatusSet")
            .next()
            .and_then(|item| item.path(&["volumeStatus", "status"]))
            .map(Element::value))
    }

    fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, CloudError> {
        let action = "DescribeSnapshots";
        let mut params = Params::new(action);
        params.set("SnapshotId.1", snapshot_id);
        let document = self.call(&params)?;

        let item = document.items("snapshotSet").next().ok_or_else(|| {
            CloudError::parse(action, format!("snapshot {snapshot_id} not returned"))
        })?;
        Ok(Snapshot {
            snapshot_id: required(action, item, "snapshotId")?,
            state: required(action, item, "status")?,
            progress: optional(item, "progress"),
        })
    }

    fn find_volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<Volume>, CloudError> {
        let action = "DescribeVolumes";
        let mut params = Params::new(action);
        params
            .set("Filter.1.Name", format!("tag:{key}"))
            .set("Filter.1.Value.1", value);
        let document = self.call(&params)?;

        document
            .items("volumeSet")
            .map(|item| parse_volume(action, item))
            .collect()
    }

    fn create_snapshot(&self, request: &CreateSnapshotRequest) -> Result<String, CloudError> {
        let action = "CreateSnapshot";
        let mut params = Params::new(action);
        params
            .set("VolumeId", &request.volume_id)
            .set("Description", &request.description)
            .set("DryRun", "false")
            .tag_specification("snapshot", &request.tags);
        let document = self.call(&params)?;

        let snapshot_id = required(action, &document, "snapshotId")?;
        info!(%snapshot_id, volume_id = %request.volume_id, "snapshot requested");
        Ok(snapshot_id)
    }

    fn create_volume(&self, request: &CreateVolumeRequest) -> Result<String, CloudError> {
        let action = "CreateVolume";
        let mut params = Params::new(action);
        params
            .set("AvailabilityZone", &request.availability_zone)
            .set("Size", request.size_gib.to_string())
            .set("VolumeType", &request.volume_type)
            .set("Encrypted", request.encrypted.to_string());
        if let Some(kms_key_id) = &request.kms_key_id {
            params.set("KmsKeyId", kms_key_id);
        }
        if let Some(iops) = request.iops {
            params.set("Iops", iops.to_string());
        }
        if let Some(throughput) = request.throughput {
            params.set("Throughput", throughput.to_string());
        }
        params.tag_specification("volume", &request.tags);
        let document = self.call(&params)?;

        let volume_id = required(action, &document, "volumeId")?;
        info!(%volume_id, size_gib = request.size_gib, "volume requested");
        Ok(volume_id)
    }

    fn create_tags(&self, resource_id: &str, tags: &[Tag]) -> Result<(), CloudError> {
        let mut params = Params::new("CreateTags");
        params.set("ResourceId.1", resource_id);
        for (i, tag) in tags.iter().enumerate() {
            let n = i + 1;
            params.set(format!("Tag.{n}.Key"), &tag.key);
            params.set(format!("Tag.{n}.Value"), &tag.value);
        }
        self.call(&params)?;
        Ok(())
    }

    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<(), CloudError> {
        let mut params = Params::new("AttachVolume");
        params
            .set("VolumeId", volume_id)
            .set("InstanceId", instance_id)
            .set("Device", device);
        self.call(&params)?;
        Ok(())
    }

    fn detach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        force: bool,
    ) -> Result<(), CloudError> {
        let mut params = Params::new("DetachVolume");
        params
            .set("VolumeId", volume_id)
            .set("InstanceId", instance_id)
            .set("Device", device)
            .set("Force", force.to_string())
            .set("DryRun", "false");
        self.call(&params)?;
        Ok(())
    }
}
