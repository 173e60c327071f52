//! C7: the FE3 SOAP delivery service (`SyncUpdates` / `GetExtendedUpdateInfo2`).
//!
//! The response XML is walked into a small parent-linked tree rather than
//! handled purely as a streaming event pipeline, because `ParseUpdateIDs`
//! needs to chase a `<SecuredFragment>` node up to its grandparent and back
//! down to that grandparent's first child -- a shape that only exists in
//! the vendor's response and has no streaming equivalent.

use crate::http::{Header, MsHttpClient};
use crate::Error;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use std::collections::HashMap;
use uuid::Uuid;

const FE3_URL: &str = "https://fe3.delivery.mp.microsoft.com/ClientWebService/client.asmx/secured";
const SOAP_CONTENT_TYPE: &str = "application/soap+xml; charset=utf-8";

/// Extensions recognized on a FE3 `FileName` GUID; `cab` carries no
/// extension in the GUID→Name map.
const RECOGNIZED_EXTENSIONS: &[&str] = &[
    "appx", "msix", "msixbundle", "appxbundle", "eappx", "emsix", "cab",
];

/// A single `<File>` entry's recognized pieces.
#[derive(Clone, Debug)]
struct FileEntry {
    guid: String,
    ext: Option<String>,
    installer_specific_identifier: Option<String>,
}

/// Result of [`parse_update_ids`]: the ordered UpdateID/RevisionID pairs to
/// feed into `GetExtendedUpdateInfo2`, plus the GUID→Name map used to
/// resolve download URLs to real filenames.
#[derive(Clone, Debug, Default)]
pub struct ParsedUpdateIds {
    pub update_ids: Vec<Uuid>,
    pub revision_ids: Vec<i64>,
    pub guid_to_name: HashMap<String, String>,
}

/// Per-update metadata extracted from `ExtendedUpdateInfo/Updates/Update`
/// entries: size and the properties needed for main-package detection.
#[derive(Clone, Debug, Default)]
pub struct UpdateInfo {
    pub package_moniker: Option<String>,
    pub size: Option<i64>,
    pub is_appx_framework: bool,
    pub package_rank: i32,
}

/// A minimal parent-linked XML tree, built once per response so that
/// ancestor/descendant queries don't require re-parsing.
struct XmlTree {
    nodes: Vec<XmlNode>,
}

struct XmlNode {
    local_name: String,
    attrs: Vec<(String, String)>,
    text: String,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl XmlTree {
    fn parse(xml: &str) -> Result<Self, Error> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut nodes = vec![XmlNode {
            local_name: "#root".to_string(),
            attrs: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
        }];
        let mut stack = vec![0usize];
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => {
                    let idx = push_node(&mut nodes, &stack, &e)?;
                    stack.push(idx);
                }
                Ok(Event::Empty(e)) => {
                    push_node(&mut nodes, &stack, &e)?;
                }
                Ok(Event::End(_)) => {
                    stack.pop();
                }
                Ok(Event::Text(t)) => {
                    if let Some(&top) = stack.last() {
                        nodes[top].text.push_str(&t.unescape().unwrap_or_default());
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(Error::decode("FE3 response xml", e)),
                _ => {}
            }
            buf.clear();
        }

        Ok(Self { nodes })
    }

    fn find_all(&self, local_name: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.local_name == local_name)
            .map(|(i, _)| i)
            .collect()
    }

    fn attr(&self, idx: usize, name: &str) -> Option<&str> {
        self.nodes[idx]
            .attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn grandparent(&self, idx: usize) -> Option<usize> {
        let parent = self.nodes[idx].parent?;
        self.nodes[parent].parent
    }

    fn first_child(&self, idx: usize) -> Option<usize> {
        self.nodes[idx].children.first().copied()
    }
}

fn push_node(
    nodes: &mut Vec<XmlNode>,
    stack: &[usize],
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<usize, Error> {
    let local_name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::decode("FE3 response xml attribute", err))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value().unwrap_or_default().into_owned();
        attrs.push((key, value));
    }

    let idx = nodes.len();
    nodes.push(XmlNode {
        local_name,
        attrs,
        text: String::new(),
        parent: stack.last().copied(),
        children: Vec::new(),
    });
    if let Some(&parent) = stack.last() {
        nodes[parent].children.push(idx);
    }
    Ok(idx)
}

fn file_name_ext(file_name: &str) -> Option<(&str, Option<&str>)> {
    match file_name.rsplit_once('.') {
        Some((guid, ext)) if RECOGNIZED_EXTENSIONS.contains(&ext) => {
            if ext == "cab" {
                Some((guid, None))
            } else {
                Some((guid, Some(ext)))
            }
        }
        _ => None,
    }
}

/// Walks every `<File>` node to build the GUID→Name map, then walks every
/// `<SecuredFragment>` node, chasing to its grandparent's first child (the
/// `<UpdateIdentity>` element) to collect `UpdateID`/`RevisionNumber`
/// pairs in document order.
pub fn parse_update_ids(xml: &str) -> Result<ParsedUpdateIds, Error> {
    let tree = XmlTree::parse(xml)?;

    let mut guid_to_name = HashMap::new();
    for file_idx in tree.find_all("File") {
        let Some(file_name) = tree.attr(file_idx, "FileName") else {
            continue;
        };
        let Some((guid, ext)) = file_name_ext(file_name) else {
            continue;
        };
        let key = match ext {
            Some(ext) => format!("{guid}.{ext}"),
            None => guid.to_string(),
        };
        if let Some(moniker) = tree.attr(file_idx, "InstallerSpecificIdentifier") {
            guid_to_name.insert(key, moniker.to_string());
        }
    }

    let mut update_ids = Vec::new();
    let mut revision_ids = Vec::new();
    for fragment_idx in tree.find_all("SecuredFragment") {
        let Some(grandparent) = tree.grandparent(fragment_idx) else {
            continue;
        };
        let Some(identity_idx) = tree.first_child(grandparent) else {
            continue;
        };
        if tree.nodes[identity_idx].local_name != "UpdateIdentity" {
            continue;
        }
        let Some(update_id) = tree
            .attr(identity_idx, "UpdateID")
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            continue;
        };
        let revision_id = tree
            .attr(identity_idx, "RevisionNumber")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        update_ids.push(update_id);
        revision_ids.push(revision_id);
    }

    Ok(ParsedUpdateIds {
        update_ids,
        revision_ids,
        guid_to_name,
    })
}

/// Parses an `ExtendedUpdateInfo/Updates/Update` block into an
/// `UpdateID → UpdateInfo` map via the inner `<ID>`/`UpdateInfo` indirection
/// spec.md §4.7 describes.
pub fn parse_extended_update_info(xml: &str) -> Result<HashMap<Uuid, UpdateInfo>, Error> {
    let tree = XmlTree::parse(xml)?;

    // Map inner numeric <ID> (as text of a child node) -> UpdateID, sourced
    // from each <UpdateInfo> block's <UpdateIdentity UpdateID="...">.
    let mut inner_id_to_update_id = HashMap::new();
    for info_idx in tree.find_all("UpdateInfo") {
        let Some(inner_id_idx) = tree
            .nodes[info_idx]
            .children
            .iter()
            .find(|&&c| tree.nodes[c].local_name == "ID")
        else {
            continue;
        };
        let inner_id = tree.nodes[*inner_id_idx].text.trim().to_string();

        let Some(identity_idx) = tree.nodes[info_idx]
            .children
            .iter()
            .find(|&&c| tree.nodes[c].local_name == "UpdateIdentity")
        else {
            continue;
        };
        let Some(update_id) = tree
            .attr(*identity_idx, "UpdateID")
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            continue;
        };

        inner_id_to_update_id.insert(inner_id, update_id);
    }

    let mut result = HashMap::new();
    for update_idx in tree.find_all("Update") {
        let Some(inner_id_idx) = tree.nodes[update_idx]
            .children
            .iter()
            .find(|&&c| tree.nodes[c].local_name == "ID")
        else {
            continue;
        };
        let inner_id = tree.nodes[*inner_id_idx].text.trim().to_string();

        let Some(&update_id) = inner_id_to_update_id.get(&inner_id) else {
            continue;
        };

        let file_idx = tree.nodes[update_idx]
            .children
            .iter()
            .find(|&&c| tree.nodes[c].local_name == "File");
        let size = file_idx
            .and_then(|&i| tree.attr(i, "Size"))
            .and_then(|s| s.parse::<i64>().ok());

        let package_moniker = find_descendant_text(&tree, update_idx, "PackageMoniker");
        let is_appx_framework = find_descendant_text(&tree, update_idx, "IsAppxFramework")
            .map(|s| s == "true")
            .unwrap_or(false);
        let package_rank = find_descendant_text(&tree, update_idx, "PackageRank")
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(100);

        result.insert(
            update_id,
            UpdateInfo {
                package_moniker,
                size,
                is_appx_framework,
                package_rank,
            },
        );
    }

    Ok(result)
}

fn find_descendant_text(tree: &XmlTree, root: usize, local_name: &str) -> Option<String> {
    let mut stack = vec![root];
    while let Some(idx) = stack.pop() {
        if tree.nodes[idx].local_name == local_name && !tree.nodes[idx].text.is_empty() {
            return Some(tree.nodes[idx].text.clone());
        }
        stack.extend(tree.nodes[idx].children.iter().copied());
    }
    None
}

/// The large, mostly-opaque device-attributes string FE3 expects on every
/// `SyncUpdates` call. Its exact contents matter to the server only in
/// that they describe a plausible Windows client; the fields below are
/// the ones observed to matter for AppX category filtering.
fn device_attributes() -> String {
    "E:BranchReadinessLevel=CBB&DchuNvidiaGrfxExists=1&DchuAmdGrfxExists=1&\
     FlightRing=Retail&AttrDataVer=209&InstallLanguage=en-US&OSUILocale=en-US&\
     InstallationType=Client&FlightingBranchName=Retail&Steam=0&Virtual=0&\
     OSSkuId=48&App=WU&InstancePatched=0&OSVersion=10.0.19045&IsFlightingEnabled=0&\
     UpdateManagementExperience=1"
        .to_string()
}

const FILTER_CATEGORIES: &str = "8b24b027-1dee-babb-9a95-3517dfb9c552";

fn sync_updates_envelope(wu_category_id: &str, msa_token: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
               xmlns:wuws="http://www.microsoft.com/SoftwareDistribution">
  <soap:Header>
    <wuws:WindowsUpdateTicketsToken wuws:id="ClientTicket">{msa_token}</wuws:WindowsUpdateTicketsToken>
    <wuws:Action>SyncUpdates</wuws:Action>
  </soap:Header>
  <soap:Body>
    <SyncUpdates xmlns="http://www.microsoft.com/SoftwareDistribution">
      <cookie><Expiration>9999-12-31T00:00:00Z</Expiration></cookie>
      <parameters>
        <ExpressQuery>false</ExpressQuery>
        <InstalledNonLeafUpdateIDs/>
        <OtherCachedUpdateIDs/>
        <SkipSoftwareSync>false</SkipSoftwareSync>
        <NeedTwoGroupOutOfScopeUpdates>true</NeedTwoGroupOutOfScopeUpdates>
        <FilterAppCategoryIds>
          <CategoryIdentifier><Id>{FILTER_CATEGORIES}</Id></CategoryIdentifier>
        </FilterAppCategoryIds>
        <TreatAppCategoryIdsAsInstalled>true</TreatAppCategoryIdsAsInstalled>
        <AlsoPerformRegularSync>false</AlsoPerformRegularSync>
        <ComputerSpec/>
        <ExtendedUpdateInfoParameters>
          <XmlUpdateFragmentTypes>
            <XmlUpdateFragmentType>Extended</XmlUpdateFragmentType>
            <XmlUpdateFragmentType>LocalizedProperties</XmlUpdateFragmentType>
            <XmlUpdateFragmentType>Relationships</XmlUpdateFragmentType>
          </XmlUpdateFragmentTypes>
        </ExtendedUpdateInfoParameters>
        <ClientPreferredLanguages><string>en-US</string></ClientPreferredLanguages>
        <ProductsParameters>
          <SyncCurrentVersionOnly>false</SyncCurrentVersionOnly>
          <DeviceAttributes>{device_attributes}</DeviceAttributes>
          <CallerAttributes>E:Interactive=1&amp;IsSeeker=1&amp;</CallerAttributes>
          <Products>
            <Product>
              <Categories>
                <Category><CategoryId>{wu_category_id}</CategoryId></Category>
              </Categories>
              <ProductId>{wu_category_id}</ProductId>
            </Product>
          </Products>
        </ProductsParameters>
      </parameters>
    </SyncUpdates>
  </soap:Body>
</soap:Envelope>"#,
        msa_token = xml_escape(msa_token),
        wu_category_id = wu_category_id,
        device_attributes = device_attributes(),
    )
}

fn get_extended_update_info2_envelope(
    update_ids: &[Uuid],
    revision_ids: &[i64],
    msa_token: &str,
) -> String {
    let pairs: String = update_ids
        .iter()
        .zip(revision_ids.iter())
        .map(|(id, rev)| {
            format!("<UpdateIdentity><UpdateID>{id}</UpdateID><RevisionNumber>{rev}</RevisionNumber></UpdateIdentity>")
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
               xmlns:wuws="http://www.microsoft.com/SoftwareDistribution"
               xmlns="http://www.microsoft.com/SoftwareDistribution">
  <soap:Header>
    <wuws:WindowsUpdateTicketsToken wuws:id="ClientTicket">{msa_token}</wuws:WindowsUpdateTicketsToken>
    <wuws:Action>GetExtendedUpdateInfo2</wuws:Action>
  </soap:Header>
  <soap:Body>
    <GetExtendedUpdateInfo2>
      <updateIDs>{pairs}</updateIDs>
      <infoTypes>
        <XmlUpdateFragmentType>FileUrl</XmlUpdateFragmentType>
        <XmlUpdateFragmentType>FileDecoration</XmlUpdateFragmentType>
        <XmlUpdateFragmentType>Extended</XmlUpdateFragmentType>
      </infoTypes>
      <deviceAttributes>{device_attributes}</deviceAttributes>
    </GetExtendedUpdateInfo2>
  </soap:Body>
</soap:Envelope>"#,
        msa_token = xml_escape(msa_token),
        pairs = pairs,
        device_attributes = device_attributes(),
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub struct Fe3Client<'a> {
    http: &'a MsHttpClient,
}

impl<'a> Fe3Client<'a> {
    pub fn new(http: &'a MsHttpClient) -> Self {
        Self { http }
    }

    pub fn sync_updates(&self, wu_category_id: &str, msa_token: &str) -> Result<String, Error> {
        let body = sync_updates_envelope(wu_category_id, msa_token);
        let response = self.http.post(
            FE3_URL,
            body.as_bytes(),
            SOAP_CONTENT_TYPE,
            &[Header("SOAPAction", "SyncUpdates")],
        )?;
        response.text()
    }

    /// Returns every `<FileLocation><Url>` in document order whose text
    /// length is not exactly 99 (the BlockMap-stub length).
    pub fn get_file_urls(
        &self,
        update_ids: &[Uuid],
        revision_ids: &[i64],
        msa_token: &str,
    ) -> Result<Vec<String>, Error> {
        let body = get_extended_update_info2_envelope(update_ids, revision_ids, msa_token);
        let response = self.http.post(
            FE3_URL,
            body.as_bytes(),
            SOAP_CONTENT_TYPE,
            &[Header("SOAPAction", "GetExtendedUpdateInfo2")],
        )?;
        let xml = response.text()?;

        let tree = XmlTree::parse(&xml)?;
        let mut urls = Vec::new();
        for loc_idx in tree.find_all("FileLocation") {
            let Some(&url_idx) = tree.nodes[loc_idx]
                .children
                .iter()
                .find(|&&c| tree.nodes[c].local_name == "Url")
            else {
                continue;
            };
            let text = tree.nodes[url_idx].text.trim();
            if text.len() != 99 {
                urls.push(text.to_string());
            }
        }

        Ok(urls)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE_SYNC_RESPONSE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <SyncUpdatesResult>
      <NewUpdates>
        <File FileName="11111111-1111-1111-1111-111111111111.appx" InstallerSpecificIdentifier="Contoso.App_1.0.0.0_x64__8wekyb3d8bbwe"/>
        <UpdateInfo>
          <UpdateIdentity UpdateID="22222222-2222-2222-2222-222222222222" RevisionNumber="1"/>
          <Deployment>
            <Payload>
              <SecuredFragment/>
            </Payload>
          </Deployment>
        </UpdateInfo>
      </NewUpdates>
    </SyncUpdatesResult>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn builds_guid_to_name_map() {
        let parsed = parse_update_ids(SAMPLE_SYNC_RESPONSE).unwrap();
        assert_eq!(
            parsed.guid_to_name.get("11111111-1111-1111-1111-111111111111.appx"),
            Some(&"Contoso.App_1.0.0.0_x64__8wekyb3d8bbwe".to_string())
        );
    }

    #[test]
    fn walks_secured_fragment_to_grandparents_first_child() {
        let parsed = parse_update_ids(SAMPLE_SYNC_RESPONSE).unwrap();
        assert_eq!(parsed.update_ids.len(), 1);
        assert_eq!(
            parsed.update_ids[0].to_string(),
            "22222222-2222-2222-2222-222222222222"
        );
        assert_eq!(parsed.revision_ids[0], 1);
    }

    #[test]
    fn file_name_ext_strips_cab_extension() {
        assert_eq!(
            file_name_ext("abc-def.cab"),
            Some(("abc-def", None))
        );
        assert_eq!(
            file_name_ext("abc-def.msixbundle"),
            Some(("abc-def", Some("msixbundle")))
        );
        assert_eq!(file_name_ext("abc-def.exe"), None);
    }

    #[test]
    fn filters_99_length_blockmap_stub_urls() {
        let xml = format!(
            r#"<r><FileLocation><Url>{}</Url></FileLocation><FileLocation><Url>https://example.com/real/file.appx</Url></FileLocation></r>"#,
            "x".repeat(99)
        );
        let tree = XmlTree::parse(&xml).unwrap();
        let mut urls = Vec::new();
        for loc_idx in tree.find_all("FileLocation") {
            let url_idx = tree.nodes[loc_idx]
                .children
                .iter()
                .find(|&&c| tree.nodes[c].local_name == "Url")
                .copied()
                .unwrap();
            let text = tree.nodes[url_idx].text.trim();
            if text.len() != 99 {
                urls.push(text.to_string());
            }
        }
        assert_eq!(urls, vec!["https://example.com/real/file.appx".to_string()]);
    }
}
