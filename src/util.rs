//! Plist formatting helpers shared across the crate

/// Serializes a dictionary to XML plist bytes
pub(crate) fn plist_to_xml_bytes(p: &plist::Dictionary) -> Vec<u8> {
    let buf = Vec::new();
    let mut writer = std::io::BufWriter::new(buf);
    plist::to_writer_xml(&mut writer, &p).expect("writing to a Vec cannot fail");

    writer.into_inner().expect("writing to a Vec cannot fail")
}

/// Renders a plist value for debug logs, eliding binary blobs
pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

/// Renders a dictionary for debug logs, eliding binary blobs
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{k}: {}", print_plist(v, 1)))
        .collect();
    format!("{{\n{}\n}}", items.join(",\n"))
}

fn print_plist(p: &plist::Value, depth: usize) -> String {
    let indent = "  ".repeat(depth);
    match p {
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::Real(r) => r.to_string(),
        plist::Value::Date(d) => d.to_xml_format(),
        plist::Value::Data(d) => format!("<{} bytes>", d.len()),
        plist::Value::Array(a) => {
            let items: Vec<String> = a.iter().map(|v| print_plist(v, depth + 1)).collect();
            format!("[{}]", items.join(", "))
        }
        plist::Value::Dictionary(d) => {
            let items: Vec<String> = d
                .iter()
                .map(|(k, v)| format!("{indent}  {k}: {}", print_plist(v, depth + 1)))
                .collect();
            format!("{{\n{}\n{indent}}}", items.join(",\n"))
        }
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_is_elided() {
        let mut dict = plist::Dictionary::new();
        dict.insert("Payload".into(), plist::Value::Data(vec![0; 1024]));
        let printed = pretty_print_dictionary(&dict);
        assert!(printed.contains("<1024 bytes>"));
        assert!(!printed.contains('\0'));
    }

    #[test]
    fn xml_bytes_roundtrip() {
        // One of everything the device protocols put on the wire
        let mut inner = plist::Dictionary::new();
        inner.insert("EnableServiceSSL".into(), true.into());
        inner.insert("Port".into(), 49152u64.into());

        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "GetValue".into());
        dict.insert("Escaped".into(), "a & b <c>".into());
        dict.insert("Retries".into(), 3.into());
        dict.insert("Blob".into(), plist::Value::Data(vec![0x00, 0xFF, 0x42]));
        dict.insert(
            "List".into(),
            plist::Value::Array(vec!["x".into(), 7u64.into(), false.into()]),
        );
        dict.insert("Nested".into(), plist::Value::Dictionary(inner));

        let bytes = plist_to_xml_bytes(&dict);
        let back: plist::Dictionary = plist::from_bytes(&bytes).unwrap();
        assert_eq!(back, dict);
        // Insertion order is part of the encoding
        let keys: Vec<&String> = back.keys().collect();
        assert_eq!(keys[0], "Request");
        assert_eq!(keys[1], "Escaped");
    }
}
