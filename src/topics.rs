pub const INITIAL_REQUEST: &str = "connection/inirequest";
pub const CLIENT_WILDCARD: &str = "client/#";

/// Topic filters the relay listens on.
pub const SUBSCRIPTIONS: [&str; 2] = [INITIAL_REQUEST, CLIENT_WILDCARD];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    AddWhitelist,
    EnergyData,
    Metadata,
    Disconnect,
    Email,
    Unknown(String),
}

impl ClientAction {
    fn parse(segment: &str) -> Self {
        match segment {
            "addwhitelist" => ClientAction::AddWhitelist,
            "energy_data" => ClientAction::EnergyData,
            "modelMTDT" => ClientAction::Metadata,
            "disconnect" => ClientAction::Disconnect,
            "email" => ClientAction::Email,
            other => ClientAction::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayTopic<'a> {
    InitialRequest,
    Client {
        client_id: &'a str,
        action: ClientAction,
    },
    Other,
}

/// Classify an incoming topic.
///
/// `client/{id}/{action}` uses the third segment as the action; anything
/// after it is ignored. A client topic without an action still names a
/// client, so it is still subject to the whitelist guard.
pub fn parse(topic: &str) -> RelayTopic<'_> {
    if topic == INITIAL_REQUEST {
        return RelayTopic::InitialRequest;
    }
    let Some(rest) = topic.strip_prefix("client/") else {
        return RelayTopic::Other;
    };
    let mut parts = rest.split('/');
    let client_id = parts.next().unwrap_or_default();
    if client_id.is_empty() {
        return RelayTopic::Other;
    }
    let action = ClientAction::parse(parts.next().unwrap_or_default());
    RelayTopic::Client { client_id, action }
}

pub fn challenge_topic(client_id: &str) -> String {
    format!("connection/challenge/{client_id}")
}

/// Fill `{client_id}` in a configured topic template.
pub fn render(template: &str, client_id: &str) -> String {
    template.replace("{client_id}", client_id)
}
