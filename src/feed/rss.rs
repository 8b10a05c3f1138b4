use xml::name::OwnedName;
use xml::reader::{ParserConfig, XmlEvent};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssFeed {
    pub channel: RssChannel,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssChannel {
    pub title: String,
    pub link: String,
    pub description: String,
    pub items: Vec<RssItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RssItem {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Raw `pubDate` text; parsing is left to the caller.
    pub pub_date: String,
}

/// Decode an RSS 2.0 document.
///
/// Only un-prefixed elements are read, so extension elements such as
/// `atom:link` or `dc:date` never overwrite the core fields. Text is taken
/// as-is after XML entity decoding; no HTML unescaping happens here. Elements
/// nested inside a field are dropped along with their text, and the field
/// keeps the text around them.
pub fn parse(bytes: &[u8]) -> Result<RssFeed> {
    let reader = ParserConfig::new()
        .cdata_to_characters(true)
        .create_reader(bytes);

    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();
    let mut channel: Option<RssChannel> = None;
    let mut item: Option<RssItem> = None;

    for event in reader {
        match event.map_err(|e| AppError::Decode(e.to_string()))? {
            XmlEvent::StartElement { name, .. } => {
                let element = qualified(&name);
                if path.is_empty() && element != "rss" {
                    return Err(AppError::Decode(format!(
                        "expected <rss> root element, found <{}>",
                        element
                    )));
                }
                path.push(element);

                match path_of(&path).as_slice() {
                    ["rss", "channel"] if channel.is_none() => channel = Some(RssChannel::default()),
                    ["rss", "channel", "item"] => item = Some(RssItem::default()),
                    _ => {}
                }
                if is_field(&path) {
                    text.clear();
                }
            }
            XmlEvent::Characters(chunk) | XmlEvent::Whitespace(chunk) if is_field(&path) => {
                text.push_str(&chunk)
            }
            XmlEvent::EndElement { .. } => {
                if is_field(&path) {
                    let value = std::mem::take(&mut text).trim().to_string();
                    store_field(&path, value, channel.as_mut(), item.as_mut());
                } else if let ["rss", "channel", "item"] = path_of(&path).as_slice() {
                    if let Some(channel) = channel.as_mut() {
                        channel.items.extend(item.take());
                    }
                }

                path.pop();
            }
            _ => {}
        }
    }

    channel
        .map(|channel| RssFeed { channel })
        .ok_or_else(|| AppError::Decode("missing <channel> element".to_string()))
}

fn qualified(name: &OwnedName) -> String {
    match &name.prefix {
        Some(prefix) => format!("{}:{}", prefix, name.local_name),
        None => name.local_name.clone(),
    }
}

/// Whether the innermost open element is a recorded channel or item field.
fn is_field(path: &[String]) -> bool {
    match path_of(path).as_slice() {
        ["rss", "channel", field] => *field != "item",
        ["rss", "channel", "item", _] => true,
        _ => false,
    }
}

fn store_field(
    path: &[String],
    value: String,
    channel: Option<&mut RssChannel>,
    item: Option<&mut RssItem>,
) {
    match path_of(path).as_slice() {
        ["rss", "channel", field] => {
            if let Some(channel) = channel {
                match *field {
                    "title" => channel.title = value,
                    "link" => channel.link = value,
                    "description" => channel.description = value,
                    _ => {}
                }
            }
        }
        ["rss", "channel", "item", field] => {
            if let Some(item) = item {
                match *field {
                    "title" => item.title = value,
                    "link" => item.link = value,
                    "description" => item.description = value,
                    "pubDate" => item.pub_date = value,
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn path_of(path: &[String]) -> Vec<&str> {
    path.iter().map(String::as_str).collect()
}
