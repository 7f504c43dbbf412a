//! Call-control documents (cXML)
//!
//! The provider fetches one of these whenever it needs to know what to do
//! with a call. Documents are built from a small typed model and rendered
//! with quick-xml so text and attributes are always escaped.

use std::io::Cursor;

use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::Writer;
use thiserror::Error;

/// Served when rendering fails. Must stay valid.
pub const FALLBACK_DOCUMENT: &str =
    "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Hangup/></Response>";

const ERROR_MESSAGE: &str = "We're sorry, an application error occurred. Please try again later.";
const STATUS_EVENTS: &str = "initiated ringing answered completed";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("XML write error: {0}")]
    Xml(String),
    #[error("Document is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlDocument {
    pub verbs: Vec<Verb>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Say(String),
    Pause { length: u32 },
    Dial(Dial),
    Hangup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dial {
    pub target: DialTarget,
    /// Fetched when the dialed leg ends; answered by the dial-action handler.
    pub action: Option<String>,
    pub timeout: Option<u32>,
    pub caller_id: Option<String>,
    pub record: Option<&'static str>,
    pub recording_status_callback: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DialTarget {
    Number {
        number: String,
        status_callback: Option<String>,
    },
    Sip {
        uri: String,
    },
    Conference {
        name: String,
        options: ConferenceOptions,
    },
}

/// Enter/exit semantics of one conference participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceOptions {
    pub start_on_enter: bool,
    pub end_on_exit: bool,
    pub beep: bool,
    pub wait_url: Option<String>,
    pub record: Option<&'static str>,
    pub recording_status_callback: Option<String>,
    pub status_callback: Option<String>,
}

impl Default for ConferenceOptions {
    fn default() -> Self {
        Self {
            start_on_enter: true,
            end_on_exit: false,
            beep: true,
            wait_url: None,
            record: None,
            recording_status_callback: None,
            status_callback: None,
        }
    }
}

impl Dial {
    pub fn new(target: DialTarget) -> Self {
        Self {
            target,
            action: None,
            timeout: None,
            caller_id: None,
            record: None,
            recording_status_callback: None,
        }
    }

    pub fn action(mut self, url: impl Into<String>) -> Self {
        self.action = Some(url.into());
        self
    }

    pub fn timeout(mut self, seconds: u32) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn caller_id(mut self, number: impl Into<String>) -> Self {
        self.caller_id = Some(number.into());
        self
    }

    pub fn record_from_answer(mut self, callback: Option<String>) -> Self {
        self.record = Some("record-from-answer");
        self.recording_status_callback = callback;
        self
    }
}

impl ControlDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.verbs.push(Verb::Say(text.into()));
        self
    }

    pub fn pause(mut self, length: u32) -> Self {
        self.verbs.push(Verb::Pause { length });
        self
    }

    pub fn dial(mut self, dial: Dial) -> Self {
        self.verbs.push(Verb::Dial(dial));
        self
    }

    pub fn then_hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    /// Speak a message and hang up.
    pub fn decline(message: &str) -> Self {
        Self::new().say(message).then_hangup()
    }

    pub fn hangup() -> Self {
        Self::new().then_hangup()
    }

    pub fn empty() -> Self {
        Self::new()
    }

    /// Bridge the caller to a SIP endpoint.
    pub fn bridge_sip(uri: &str, action: Option<String>) -> Self {
        let mut dial = Dial::new(DialTarget::Sip { uri: uri.to_string() });
        dial.action = action;
        Self::new().dial(dial)
    }

    /// Degraded document for unexpected failures on the call path.
    pub fn error_fallback() -> Self {
        Self::decline(ERROR_MESSAGE)
    }

    pub fn render(&self) -> Result<String, DocumentError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| DocumentError::Xml(e.to_string()))?;
        start(&mut writer, BytesStart::new("Response"))?;

        for verb in &self.verbs {
            match verb {
                Verb::Say(text) => text_element(&mut writer, "Say", text)?,
                Verb::Pause { length } => {
                    let mut elem = BytesStart::new("Pause");
                    elem.push_attribute(("length", length.to_string().as_str()));
                    empty(&mut writer, elem)?;
                }
                Verb::Hangup => empty(&mut writer, BytesStart::new("Hangup"))?,
                Verb::Dial(dial) => write_dial(&mut writer, dial)?,
            }
        }

        end(&mut writer, "Response")?;

        let xml = writer.into_inner().into_inner();
        Ok(String::from_utf8(xml)?)
    }

    /// Rendered body, or [`FALLBACK_DOCUMENT`] if rendering fails.
    pub fn to_body(&self) -> String {
        match self.render() {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to render control document: {}", e);
                FALLBACK_DOCUMENT.to_string()
            }
        }
    }
}

impl IntoResponse for ControlDocument {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, "application/xml")], self.to_body()).into_response()
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn write_dial(writer: &mut XmlWriter, dial: &Dial) -> Result<(), DocumentError> {
    let mut elem = BytesStart::new("Dial");
    if let Some(action) = &dial.action {
        elem.push_attribute(("action", action.as_str()));
        elem.push_attribute(("method", "POST"));
    }
    if let Some(timeout) = dial.timeout {
        elem.push_attribute(("timeout", timeout.to_string().as_str()));
    }
    if let Some(caller_id) = &dial.caller_id {
        elem.push_attribute(("callerId", caller_id.as_str()));
    }
    if let Some(record) = dial.record {
        elem.push_attribute(("record", record));
    }
    if let Some(callback) = &dial.recording_status_callback {
        elem.push_attribute(("recordingStatusCallback", callback.as_str()));
    }
    start(writer, elem)?;

    match &dial.target {
        DialTarget::Number { number, status_callback } => {
            let mut elem = BytesStart::new("Number");
            if let Some(callback) = status_callback {
                elem.push_attribute(("statusCallback", callback.as_str()));
                elem.push_attribute(("statusCallbackEvent", STATUS_EVENTS));
                elem.push_attribute(("statusCallbackMethod", "POST"));
            }
            start(writer, elem)?;
            text(writer, number)?;
            end(writer, "Number")?;
        }
        DialTarget::Sip { uri } => text_element(writer, "Sip", uri)?,
        DialTarget::Conference { name, options } => {
            let mut elem = BytesStart::new("Conference");
            elem.push_attribute(("startConferenceOnEnter", bool_attr(options.start_on_enter)));
            elem.push_attribute(("endConferenceOnExit", bool_attr(options.end_on_exit)));
            elem.push_attribute(("beep", bool_attr(options.beep)));
            if let Some(wait_url) = &options.wait_url {
                elem.push_attribute(("waitUrl", wait_url.as_str()));
            }
            if let Some(record) = options.record {
                elem.push_attribute(("record", record));
            }
            if let Some(callback) = &options.recording_status_callback {
                elem.push_attribute(("recordingStatusCallback", callback.as_str()));
            }
            if let Some(callback) = &options.status_callback {
                elem.push_attribute(("statusCallback", callback.as_str()));
                elem.push_attribute(("statusCallbackEvent", "start end join leave"));
            }
            start(writer, elem)?;
            text(writer, name)?;
            end(writer, "Conference")?;
        }
    }

    end(writer, "Dial")
}

fn bool_attr(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

fn start(writer: &mut XmlWriter, elem: BytesStart) -> Result<(), DocumentError> {
    writer
        .write_event(Event::Start(elem))
        .map_err(|e| DocumentError::Xml(e.to_string()))
}

fn end(writer: &mut XmlWriter, name: &str) -> Result<(), DocumentError> {
    writer
        .write_event(Event::End(BytesStart::new(name).to_end()))
        .map_err(|e| DocumentError::Xml(e.to_string()))
}

fn empty(writer: &mut XmlWriter, elem: BytesStart) -> Result<(), DocumentError> {
    writer
        .write_event(Event::Empty(elem))
        .map_err(|e| DocumentError::Xml(e.to_string()))
}

fn text(writer: &mut XmlWriter, value: &str) -> Result<(), DocumentError> {
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(|e| DocumentError::Xml(e.to_string()))
}

fn text_element(writer: &mut XmlWriter, name: &str, value: &str) -> Result<(), DocumentError> {
    start(writer, BytesStart::new(name))?;
    text(writer, value)?;
    end(writer, name)
}
