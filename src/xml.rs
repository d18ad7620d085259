//! S3-style XML response rendering.
//!
//! All object-API responses are XML-encoded.  This module produces the
//! payloads using `quick-xml`.  Every document starts with the fixed
//! declaration [`XML_HEADER`] followed by a newline, which is what the
//! AWS SDKs' parsers are fed in practice.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Cursor;

/// The literal declaration prefixed to every XML response.
pub const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

fn new_document() -> Writer<Cursor<Vec<u8>>> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
        .write_event(Event::Text(BytesText::from_escaped("\n")))
        .expect("decl newline");
    writer
}

fn finish(writer: Writer<Cursor<Vec<u8>>>) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

// -- Error response ----------------------------------------------------------

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchKey</Code>
///   <Message>The resource you requested does not exist</Message>
///   <Resource>/mybucket/mykey</Resource>
///   <RequestId>abcd-1234</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = new_document();
    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );
    finish(writer)
}

// -- Multipart upload --------------------------------------------------------

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut writer = new_document();
    write_simple_element_group(
        &mut writer,
        "InitiateMultipartUploadResult",
        &[("Bucket", bucket), ("Key", key), ("UploadId", upload_id)],
    );
    finish(writer)
}

/// Render `<CompleteMultipartUploadResult>`.
pub fn render_complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> String {
    let mut writer = new_document();
    write_simple_element_group(
        &mut writer,
        "CompleteMultipartUploadResult",
        &[
            ("Location", location),
            ("Bucket", bucket),
            ("Key", key),
            ("ETag", etag),
        ],
    );
    finish(writer)
}

// -- ListBucketResult (v1) ---------------------------------------------------

/// A single object entry inside a list-objects response.
pub struct ObjectEntry<'a> {
    pub key: &'a str,
    pub last_modified: &'a str,
    pub etag: &'a str,
    pub size: u64,
    pub storage_class: &'a str,
}

/// Render `<ListBucketResult>` for ListObjectsV1.
#[allow(clippy::too_many_arguments)]
pub fn render_list_objects_result(
    bucket: &str,
    prefix: &str,
    delimiter: &str,
    marker: &str,
    max_keys: u32,
    is_truncated: bool,
    entries: &[ObjectEntry<'_>],
    common_prefixes: &[&str],
    next_marker: Option<&str>,
) -> String {
    let mut writer = new_document();

    let root = BytesStart::new("ListBucketResult")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_text_element(&mut writer, "Name", bucket);
    write_text_element(&mut writer, "Prefix", prefix);
    write_text_element(&mut writer, "Marker", marker);
    if !delimiter.is_empty() {
        write_text_element(&mut writer, "Delimiter", delimiter);
    }
    write_text_element(&mut writer, "MaxKeys", &max_keys.to_string());
    write_text_element(
        &mut writer,
        "IsTruncated",
        if is_truncated { "true" } else { "false" },
    );
    if let Some(nm) = next_marker {
        write_text_element(&mut writer, "NextMarker", nm);
    }

    for entry in entries {
        writer
            .write_event(Event::Start(BytesStart::new("Contents")))
            .expect("start Contents");
        write_text_element(&mut writer, "Key", entry.key);
        write_text_element(&mut writer, "LastModified", entry.last_modified);
        write_text_element(&mut writer, "ETag", entry.etag);
        write_text_element(&mut writer, "Size", &entry.size.to_string());
        write_text_element(&mut writer, "StorageClass", entry.storage_class);
        writer
            .write_event(Event::End(BytesEnd::new("Contents")))
            .expect("end Contents");
    }

    for cp in common_prefixes {
        writer
            .write_event(Event::Start(BytesStart::new("CommonPrefixes")))
            .expect("start CommonPrefixes");
        write_text_element(&mut writer, "Prefix", cp);
        writer
            .write_event(Event::End(BytesEnd::new("CommonPrefixes")))
            .expect("end CommonPrefixes");
    }

    writer
        .write_event(Event::End(BytesEnd::new("ListBucketResult")))
        .expect("end root");

    finish(writer)
}

// -- AccessControlPolicy -----------------------------------------------------

/// One `<Grant>` in an access-control response.  All grantees the sidecar
/// emits are canonical users.
pub struct AclGrant {
    pub id: String,
    pub display_name: String,
    pub permission: String,
}

/// Render `<AccessControlPolicy>` for GetBucketAcl.
pub fn render_access_control_policy(
    owner_id: &str,
    owner_display: &str,
    grants: &[AclGrant],
) -> String {
    let mut writer = new_document();

    let root = BytesStart::new("AccessControlPolicy")
        .with_attributes([("xmlns", "http://s3.amazonaws.com/doc/2006-03-01/")]);
    writer.write_event(Event::Start(root)).expect("start root");

    write_simple_element_group(
        &mut writer,
        "Owner",
        &[("ID", owner_id), ("DisplayName", owner_display)],
    );

    writer
        .write_event(Event::Start(BytesStart::new("AccessControlList")))
        .expect("start AccessControlList");

    for grant in grants {
        writer
            .write_event(Event::Start(BytesStart::new("Grant")))
            .expect("start Grant");

        let mut grantee_start = BytesStart::new("Grantee");
        grantee_start.push_attribute(("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"));
        grantee_start.push_attribute(("xsi:type", "CanonicalUser"));
        writer
            .write_event(Event::Start(grantee_start))
            .expect("start Grantee");
        write_text_element(&mut writer, "ID", &grant.id);
        write_text_element(&mut writer, "DisplayName", &grant.display_name);
        writer
            .write_event(Event::End(BytesEnd::new("Grantee")))
            .expect("end Grantee");

        write_text_element(&mut writer, "Permission", &grant.permission);

        writer
            .write_event(Event::End(BytesEnd::new("Grant")))
            .expect("end Grant");
    }

    writer
        .write_event(Event::End(BytesEnd::new("AccessControlList")))
        .expect("end AccessControlList");
    writer
        .write_event(Event::End(BytesEnd::new("AccessControlPolicy")))
        .expect("end root");

    finish(writer)
}

// -- SQS query-protocol responses --------------------------------------------

/// Render `<SendMessageResponse>` for the SQS query protocol.
pub fn render_send_message_response(message_id: &str, md5_of_body: &str, request_id: &str) -> String {
    let mut writer = new_document();

    writer
        .write_event(Event::Start(BytesStart::new("SendMessageResponse")))
        .expect("start root");
    write_simple_element_group(
        &mut writer,
        "SendMessageResult",
        &[("MD5OfMessageBody", md5_of_body), ("MessageId", message_id)],
    );
    write_simple_element_group(&mut writer, "ResponseMetadata", &[("RequestId", request_id)]);
    writer
        .write_event(Event::End(BytesEnd::new("SendMessageResponse")))
        .expect("end root");

    finish(writer)
}

/// A single received message for `<ReceiveMessageResponse>`.
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub md5_of_body: String,
    pub body: String,
}

/// Render `<ReceiveMessageResponse>` for the SQS query protocol.
pub fn render_receive_message_response(messages: &[ReceivedMessage], request_id: &str) -> String {
    let mut writer = new_document();

    writer
        .write_event(Event::Start(BytesStart::new("ReceiveMessageResponse")))
        .expect("start root");
    writer
        .write_event(Event::Start(BytesStart::new("ReceiveMessageResult")))
        .expect("start result");

    for msg in messages {
        write_simple_element_group(
            &mut writer,
            "Message",
            &[
                ("MessageId", &msg.message_id),
                ("ReceiptHandle", &msg.receipt_handle),
                ("MD5OfBody", &msg.md5_of_body),
                ("Body", &msg.body),
            ],
        );
    }

    writer
        .write_event(Event::End(BytesEnd::new("ReceiveMessageResult")))
        .expect("end result");
    write_simple_element_group(&mut writer, "ResponseMetadata", &[("RequestId", request_id)]);
    writer
        .write_event(Event::End(BytesEnd::new("ReceiveMessageResponse")))
        .expect("end root");

    finish(writer)
}

/// Render `<DeleteMessageResponse>` for the SQS query protocol.
pub fn render_delete_message_response(request_id: &str) -> String {
    let mut writer = new_document();

    writer
        .write_event(Event::Start(BytesStart::new("DeleteMessageResponse")))
        .expect("start root");
    write_simple_element_group(&mut writer, "ResponseMetadata", &[("RequestId", request_id)]);
    writer
        .write_event(Event::End(BytesEnd::new("DeleteMessageResponse")))
        .expect("end root");

    finish(writer)
}

// -- Helpers -----------------------------------------------------------------

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

/// Write a parent element containing a flat list of child text elements.
fn write_simple_element_group(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    parent: &str,
    children: &[(&str, &str)],
) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documents_start_with_header_and_newline() {
        let doc = render_error("NoSuchKey", "gone", "/b/k", "REQ");
        assert!(doc.starts_with(&format!("{XML_HEADER}\n")));
    }

    #[test]
    fn test_render_error() {
        let doc = render_error("NoSuchKey", "gone", "/b/k", "REQ1234");
        assert!(doc.contains("<Error>"));
        assert!(doc.contains("<Code>NoSuchKey</Code>"));
        assert!(doc.contains("<RequestId>REQ1234</RequestId>"));
    }

    #[test]
    fn test_render_initiate_multipart() {
        let doc = render_initiate_multipart_upload_result("b1", "big", "u-123");
        assert!(doc.contains("<InitiateMultipartUploadResult>"));
        assert!(doc.contains("<UploadId>u-123</UploadId>"));
        assert!(doc.contains("<Bucket>b1</Bucket>"));
        assert!(doc.contains("<Key>big</Key>"));
    }

    #[test]
    fn test_render_complete_multipart() {
        let doc =
            render_complete_multipart_upload_result("/b1/big", "b1", "big", "\"abc-2\"");
        assert!(doc.contains("<CompleteMultipartUploadResult>"));
        assert!(doc.contains("<ETag>&quot;abc-2&quot;</ETag>"));
    }

    #[test]
    fn test_render_list_objects() {
        let entries = [ObjectEntry {
            key: "hello.txt",
            last_modified: "2024-01-01T00:00:00.000Z",
            etag: "\"d41d\"",
            size: 3,
            storage_class: "STANDARD",
        }];
        let doc = render_list_objects_result("b1", "", "", "", 1000, false, &entries, &[], None);
        assert!(doc.contains("<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">"));
        assert!(doc.contains("<Key>hello.txt</Key>"));
        assert!(doc.contains("<Size>3</Size>"));
        assert!(doc.contains("<IsTruncated>false</IsTruncated>"));
    }

    #[test]
    fn test_render_acl_grantee_attributes() {
        let grants = [AclGrant {
            id: "owner-1".into(),
            display_name: "owner".into(),
            permission: "FULL_CONTROL".into(),
        }];
        let doc = render_access_control_policy("owner-1", "owner", &grants);
        assert!(doc.contains(
            "<Grantee xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" \
             xsi:type=\"CanonicalUser\">"
        ));
        assert!(doc.contains("<Permission>FULL_CONTROL</Permission>"));
    }

    #[test]
    fn test_render_receive_message() {
        let messages = [ReceivedMessage {
            message_id: "m1".into(),
            receipt_handle: "ack-1".into(),
            md5_of_body: "5d41402abc4b2a76b9719d911017c592".into(),
            body: "hello".into(),
        }];
        let doc = render_receive_message_response(&messages, "REQ");
        assert!(doc.contains("<ReceiptHandle>ack-1</ReceiptHandle>"));
        assert!(doc.contains("<Body>hello</Body>"));
    }
}
