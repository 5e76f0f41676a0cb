//! Runtime parsing of UPnP device-description and SCPD documents.
//!
//! Per spec.md section 9's redesign note, action bindings are not
//! generated at compile time; instead the SCPD is parsed once (at Agent
//! initialization) into an `ActionTable` that is consulted by name at
//! call time.

use instant_xml::FromXml;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

const UPNP_DEVICE: &str = "urn:schemas-upnp-org:device-1-0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Icon {
    pub mime_type: String,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub friendly_name: String,
    pub device_type: String,
    pub model_name: Option<String>,
    pub model_number: Option<String>,
}

/// A fully parsed, URL-absolutized UPnP root description, held verbatim in
/// `DeviceState::upnp_service` (spec.md section 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootDescription {
    pub device: DeviceMetadata,
    pub icon_list: Vec<Icon>,
    pub service_list: Vec<ServiceRef>,
}

impl RootDescription {
    pub fn find_service(&self, service_type: &str) -> Option<&ServiceRef> {
        self.service_list
            .iter()
            .find(|s| s.service_type == service_type)
    }
}

#[derive(Debug, FromXml)]
#[xml(rename = "root", ns(UPNP_DEVICE))]
struct RawRoot {
    device: RawDevice,
}

#[derive(Debug, FromXml)]
#[xml(rename = "device", ns(UPNP_DEVICE))]
struct RawDevice {
    #[xml(rename = "friendlyName")]
    friendly_name: String,
    #[xml(rename = "deviceType")]
    device_type: String,
    #[xml(rename = "modelName")]
    model_name: Option<String>,
    #[xml(rename = "modelNumber")]
    model_number: Option<String>,
    #[xml(rename = "iconList")]
    icon_list: Option<RawIconList>,
    #[xml(rename = "serviceList")]
    service_list: Option<RawServiceList>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "iconList", ns(UPNP_DEVICE))]
struct RawIconList {
    icon: Vec<RawIcon>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "icon", ns(UPNP_DEVICE))]
struct RawIcon {
    mimetype: String,
    width: i32,
    height: i32,
    depth: i32,
    url: String,
}

#[derive(Debug, FromXml)]
#[xml(rename = "serviceList", ns(UPNP_DEVICE))]
struct RawServiceList {
    service: Vec<RawService>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "service", ns(UPNP_DEVICE))]
struct RawService {
    #[xml(rename = "serviceType")]
    service_type: String,
    #[xml(rename = "serviceId")]
    service_id: String,
    #[xml(rename = "SCPDURL")]
    scpd_url: String,
    #[xml(rename = "controlURL")]
    control_url: String,
    #[xml(rename = "eventSubURL")]
    event_sub_url: String,
}

fn absolutize(base: &Url, maybe_relative: &str) -> String {
    match base.join(maybe_relative) {
        Ok(joined) => joined.to_string(),
        Err(err) => {
            log::warn!("cannot join {base} with {maybe_relative}: {err:#}");
            maybe_relative.to_string()
        }
    }
}

/// Parses a device root description (`device_description.xml` equivalent)
/// and rewrites every relative URL to absolute using `base_url`'s
/// `scheme://host` (spec.md section 4.5 step 5, and the absolutization
/// invariant in section 8).
pub fn parse_root_description(xml: &str, base_url: &Url) -> crate::Result<RootDescription> {
    let root: RawRoot = instant_xml::from_str(xml).map_err(|error| crate::Error::XmlParse {
        error,
        text: xml.to_string(),
    })?;
    let device = root.device;

    let icon_list = device
        .icon_list
        .map(|l| {
            l.icon
                .into_iter()
                .map(|i| Icon {
                    mime_type: i.mimetype,
                    width: i.width,
                    height: i.height,
                    depth: i.depth,
                    url: absolutize(base_url, &i.url),
                })
                .collect()
        })
        .unwrap_or_default();

    let service_list = device
        .service_list
        .map(|l| {
            l.service
                .into_iter()
                .map(|s| ServiceRef {
                    service_type: s.service_type,
                    service_id: s.service_id,
                    scpd_url: absolutize(base_url, &s.scpd_url),
                    control_url: absolutize(base_url, &s.control_url),
                    event_sub_url: absolutize(base_url, &s.event_sub_url),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(RootDescription {
        device: DeviceMetadata {
            friendly_name: device.friendly_name,
            device_type: device.device_type,
            model_name: device.model_name,
            model_number: device.model_number,
        },
        icon_list,
        service_list,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDef {
    pub name: String,
    pub direction: Direction,
    pub related_state_variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    pub name: String,
    pub arguments: Vec<ArgumentDef>,
}

impl ActionDef {
    pub fn out_arguments(&self) -> impl Iterator<Item = &ArgumentDef> {
        self.arguments.iter().filter(|a| a.direction == Direction::Out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVariableDef {
    pub name: String,
    pub data_type: String,
}

/// A parsed SCPD: the actions a service exposes and its state-variable
/// type table, used both for generic action invocation and for typing
/// GENA event payloads (spec.md section 4.2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionTable {
    pub actions: HashMap<String, ActionDef>,
    pub state_variables: HashMap<String, StateVariableDef>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "scpd")]
struct RawScpd {
    #[xml(rename = "actionList")]
    action_list: Option<RawActionList>,
    #[xml(rename = "serviceStateTable")]
    service_state_table: Option<RawStateTable>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "actionList")]
struct RawActionList {
    action: Vec<RawAction>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "action")]
struct RawAction {
    name: String,
    #[xml(rename = "argumentList")]
    argument_list: Option<RawArgumentList>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "argumentList")]
struct RawArgumentList {
    argument: Vec<RawArgument>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "argument")]
struct RawArgument {
    name: String,
    direction: String,
    #[xml(rename = "relatedStateVariable")]
    related_state_variable: String,
}

#[derive(Debug, FromXml)]
#[xml(rename = "serviceStateTable")]
struct RawStateTable {
    #[xml(rename = "stateVariable")]
    state_variable: Vec<RawStateVariable>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "stateVariable")]
struct RawStateVariable {
    name: String,
    #[xml(rename = "dataType")]
    data_type: String,
}

/// Parses an SCPD document into an `ActionTable`.
pub fn parse_scpd(xml: &str) -> crate::Result<ActionTable> {
    let raw: RawScpd = instant_xml::from_str(xml).map_err(|error| crate::Error::XmlParse {
        error,
        text: xml.to_string(),
    })?;

    let mut actions = HashMap::new();
    for a in raw.action_list.map(|l| l.action).unwrap_or_default() {
        let arguments = a
            .argument_list
            .map(|l| {
                l.argument
                    .into_iter()
                    .map(|arg| ArgumentDef {
                        name: arg.name,
                        direction: if arg.direction == "out" {
                            Direction::Out
                        } else {
                            Direction::In
                        },
                        related_state_variable: arg.related_state_variable,
                    })
                    .collect()
            })
            .unwrap_or_default();
        actions.insert(
            a.name.clone(),
            ActionDef {
                name: a.name,
                arguments,
            },
        );
    }

    let mut state_variables = HashMap::new();
    for sv in raw.service_state_table.map(|t| t.state_variable).unwrap_or_default() {
        state_variables.insert(
            sv.name.clone(),
            StateVariableDef {
                name: sv.name,
                data_type: sv.data_type,
            },
        );
    }

    Ok(ActionTable {
        actions,
        state_variables,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const ROOT_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room</friendlyName>
    <modelName>WX-030</modelName>
    <iconList>
      <icon><mimetype>image/png</mimetype><width>48</width><height>48</height><depth>24</depth><url>/icon.png</url></icon>
    </iconList>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <SCPDURL>/upnp/avt_scpd.xml</SCPDURL>
        <controlURL>/upnp/control/avt</controlURL>
        <eventSubURL>/upnp/event/avt</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn parses_and_absolutizes() {
        let base: Url = "http://192.168.1.10:49154/desc.xml".parse().unwrap();
        let parsed = parse_root_description(ROOT_XML, &base).unwrap();
        assert_eq!(parsed.device.friendly_name, "Living Room");
        assert_eq!(parsed.icon_list[0].url, "http://192.168.1.10:49154/icon.png");
        let avt = parsed.find_service("urn:schemas-upnp-org:service:AVTransport:1").unwrap();
        assert_eq!(avt.control_url, "http://192.168.1.10:49154/upnp/control/avt");
        assert_eq!(avt.event_sub_url, "http://192.168.1.10:49154/upnp/event/avt");
    }

    const SCPD_XML: &str = r#"<?xml version="1.0"?>
<scpd>
  <actionList>
    <action>
      <name>SetAVTransportURI</name>
      <argumentList>
        <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
        <argument><name>CurrentURI</name><direction>in</direction><relatedStateVariable>AVTransportURI</relatedStateVariable></argument>
      </argumentList>
    </action>
    <action>
      <name>GetTransportInfo</name>
      <argumentList>
        <argument><name>InstanceID</name><direction>in</direction><relatedStateVariable>A_ARG_TYPE_InstanceID</relatedStateVariable></argument>
        <argument><name>CurrentTransportState</name><direction>out</direction><relatedStateVariable>TransportState</relatedStateVariable></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable><name>TransportState</name><dataType>string</dataType></stateVariable>
    <stateVariable><name>A_ARG_TYPE_InstanceID</name><dataType>ui4</dataType></stateVariable>
  </serviceStateTable>
</scpd>"#;

    #[test]
    fn parses_action_table() {
        let table = parse_scpd(SCPD_XML).unwrap();
        assert_eq!(table.actions.len(), 2);
        let get_info = &table.actions["GetTransportInfo"];
        let out_args: Vec<_> = get_info.out_arguments().map(|a| a.name.as_str()).collect();
        assert_eq!(out_args, vec!["CurrentTransportState"]);
        assert_eq!(table.state_variables["A_ARG_TYPE_InstanceID"].data_type, "ui4");
    }
}
