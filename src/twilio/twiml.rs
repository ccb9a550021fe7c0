//! TwiML generation. Pure templating: verbs are rendered into the
//! `<Response>` envelope, with all text and attribute values XML-escaped so
//! the output is well-formed even for empty or hostile content.

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Parameters for a `<Dial>` verb forwarding the call to a single number.
#[derive(Debug, Clone)]
pub struct DialNumber {
    pub number: String,
    pub timeout_secs: u64,
    /// Status callback invoked with `DialCallStatus` once the dial ends.
    pub action_url: String,
    /// Announcement played to the answering party before bridging.
    pub whisper_url: String,
    pub caller_id: String,
}

#[derive(Debug, Default)]
pub struct TwimlBuilder {
    verbs: Vec<String>,
}

impl TwimlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn say(mut self, text: &str) -> Self {
        self.verbs
            .push(format!("<Say voice=\"alice\">{}</Say>", escape_xml(text)));
        self
    }

    pub fn dial(mut self, dial: &DialNumber) -> Self {
        self.verbs.push(format!(
            "<Dial timeout=\"{}\" action=\"{}\" method=\"POST\" callerId=\"{}\">\n        <Number url=\"{}\">{}</Number>\n    </Dial>",
            dial.timeout_secs,
            escape_xml(&dial.action_url),
            escape_xml(&dial.caller_id),
            escape_xml(&dial.whisper_url),
            escape_xml(&dial.number),
        ));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push("<Hangup/>".to_string());
        self
    }

    pub fn build(self) -> String {
        if self.verbs.is_empty() {
            return format!("{}\n<Response></Response>", XML_HEADER);
        }
        let mut out = format!("{}\n<Response>\n", XML_HEADER);
        for verb in &self.verbs {
            out.push_str("    ");
            out.push_str(verb);
            out.push('\n');
        }
        out.push_str("</Response>");
        out
    }
}

/// Empty `<Response/>` document, the safe default for events that need no
/// instruction.
pub fn empty_response() -> String {
    TwimlBuilder::new().build()
}

pub fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_response_is_well_formed() {
        let twiml = empty_response();
        assert!(twiml.starts_with(XML_HEADER));
        assert!(twiml.contains("<Response></Response>"));
    }

    #[test]
    fn test_say_and_hangup() {
        let twiml = TwimlBuilder::new().say("Goodbye").hangup().build();
        assert!(twiml.contains("<Say voice=\"alice\">Goodbye</Say>"));
        assert!(twiml.contains("<Hangup/>"));
        let say_pos = twiml.find("<Say").unwrap();
        let hangup_pos = twiml.find("<Hangup").unwrap();
        assert!(say_pos < hangup_pos);
    }

    #[test]
    fn test_dial_renders_nested_number() {
        let twiml = TwimlBuilder::new()
            .dial(&DialNumber {
                number: "+15034688103".to_string(),
                timeout_secs: 30,
                action_url: "https://api.example.com/twilio/voice?x=1&y=2".to_string(),
                whisper_url: "https://api.example.com/twilio/voice/whisper".to_string(),
                caller_id: "+15559876543".to_string(),
            })
            .build();
        assert!(twiml.contains("<Dial timeout=\"30\""));
        assert!(twiml.contains("action=\"https://api.example.com/twilio/voice?x=1&amp;y=2\""));
        assert!(twiml.contains("callerId=\"+15559876543\""));
        assert!(twiml.contains("<Number url=\"https://api.example.com/twilio/voice/whisper\">+15034688103</Number>"));
    }

    #[test]
    fn test_escapes_hostile_text() {
        let twiml = TwimlBuilder::new().say("<script>\"&'</script>").build();
        assert!(!twiml.contains("<script>"));
        assert!(twiml.contains("&lt;script&gt;&quot;&amp;&apos;&lt;/script&gt;"));
    }
}
