//! Outbound stanza builders and forwarding cleanup.
//!
//! Everything the broker puts on the wire is built here, so the exact shapes
//! the legacy appliance firmware expects live in one place.

use minidom::Element;
use uuid::Uuid;

use crate::parser::ns;
use crate::{BOT_ADMIN_DOMAIN, SERVER_ID};

/// Server reply to a client stream opener.
pub fn stream_header() -> String {
    format!(
        "<stream:stream xmlns:stream='{}' xmlns='{}' version='1.0' id='{}' from='{}'>",
        ns::STREAM,
        ns::JABBER_CLIENT,
        Uuid::new_v4(),
        SERVER_ID
    )
}

/// Stream features before TLS: STARTTLS required, SASL PLAIN offered.
pub fn features_starttls() -> String {
    format!(
        "<stream:features>\
            <starttls xmlns='{}'><required/></starttls>\
            <mechanisms xmlns='{}'><mechanism>PLAIN</mechanism></mechanisms>\
        </stream:features>",
        ns::TLS,
        ns::SASL
    )
}

/// Stream features after TLS: SASL PLAIN only.
pub fn features_sasl() -> String {
    format!(
        "<stream:features>\
            <mechanisms xmlns='{}'><mechanism>PLAIN</mechanism></mechanisms>\
        </stream:features>",
        ns::SASL
    )
}

/// Stream features after authentication: bind + session.
pub fn features_bind() -> String {
    format!(
        "<stream:features>\
            <bind xmlns='{}'/>\
            <session xmlns='{}'/>\
        </stream:features>",
        ns::BIND,
        ns::SESSION
    )
}

/// STARTTLS proceed response.
pub fn tls_proceed() -> String {
    format!("<proceed xmlns='{}'/>", ns::TLS)
}

/// SASL success response.
pub fn sasl_success() -> String {
    format!("<success xmlns='{}'/>", ns::SASL)
}

/// SASL rejection. The legacy clients expect an empty `<response/>` rather
/// than the RFC `<failure/>`.
pub fn sasl_reject() -> String {
    format!("<response xmlns='{}'/>", ns::SASL)
}

/// Resource binding result carrying the assigned JID.
pub fn bind_result(id: &str, jid: &str) -> String {
    format!(
        "<iq type=\"result\" id=\"{}\"><bind xmlns=\"{}\"><jid>{}</jid></bind></iq>",
        id,
        ns::BIND,
        jid
    )
}

/// Session establishment result.
pub fn session_result(id: &str) -> String {
    format!("<iq type=\"result\" id=\"{}\"/>", id)
}

/// Reply for a ping addressed to the server itself.
pub fn server_ping_result(id: &str, to: &str) -> String {
    format!("<iq type=\"result\" id=\"{}\" from=\"{}\"/>", id, to)
}

/// Keepalive probe sent to a peer every ping interval.
pub fn ping_probe(jid: &str) -> String {
    format!(
        "<iq from='{}' to='{}' id='s2c1' type='get'><ping xmlns='{}'/></iq>",
        SERVER_ID,
        jid,
        ns::PING
    )
}

/// Stateless presence acknowledgement.
pub fn dummy_presence(jid: &str) -> String {
    format!("<presence to=\"{}\"> dummy </presence>", jid)
}

/// Device-info query pushed to a bot after its presence announcement.
pub fn get_device_info(jid: &str) -> String {
    format!(
        "<iq type=\"set\" id=\"14\" to=\"{}\" from=\"{}\"><query xmlns=\"{}\"><ctl td=\"GetDeviceInfo\"/></query></iq>",
        jid,
        SERVER_ID,
        ns::CTL
    )
}

/// 501 error for the XMPP features this broker does not implement.
pub fn feature_not_implemented(id: &str) -> String {
    format!(
        "<iq type=\"error\" id=\"{}\"><error type=\"cancel\" code=\"501\"><feature-not-implemented xmlns=\"{}\"/></error></iq>",
        id,
        ns::STANZAS
    )
}

/// Acknowledgement for the Android client's `com:sf` set directed at the
/// admin endpoint.
pub fn sf_ack(id: &str, uid: &str, resource: &str) -> String {
    format!(
        "<iq id=\"{}\" to=\"{}@{}/{}\" from=\"{}\" type=\"result\"/>",
        id, uid, SERVER_ID, resource, BOT_ADMIN_DOMAIN
    )
}

/// Enrollment step 1: add the controller as a user on the bot.
pub fn enroll_add_user(admin: &str, bot_jid: &str, newuser: &str) -> String {
    format!(
        "<iq type=\"set\" id=\"{}\" from=\"{}\" to=\"{}\"><query xmlns=\"{}\"><ctl td=\"AddUser\" id=\"0000\" jid=\"{}\" /></query></iq>",
        Uuid::new_v4(),
        admin,
        bot_jid,
        ns::CTL,
        newuser
    )
}

/// Enrollment step 2: grant the full access-control set.
pub fn enroll_set_acs(admin: &str, bot_jid: &str, newuser: &str) -> String {
    format!(
        "<iq type=\"set\" id=\"{}\" from=\"{}\" to=\"{}\"><query xmlns=\"{}\"><ctl td=\"SetAC\" id=\"1111\" jid=\"{}\"><acs><ac name=\"userman\" allow=\"1\"/><ac name=\"setting\" allow=\"1\"/><ac name=\"clean\" allow=\"1\"/></acs></ctl></query></iq>",
        Uuid::new_v4(),
        admin,
        bot_jid,
        ns::CTL,
        newuser
    )
}

/// Enrollment step 3: read the user list back to confirm.
pub fn enroll_get_user_info(admin: &str, bot_jid: &str) -> String {
    format!(
        "<iq type=\"set\" id=\"{}\" from=\"{}\" to=\"{}\"><query xmlns=\"{}\"><ctl td=\"GetUserInfo\" id=\"4444\" /><UserInfos/></query></iq>",
        Uuid::new_v4(),
        admin,
        bot_jid,
        ns::CTL
    )
}

/// Stream close tag.
pub fn stream_close() -> &'static str {
    "</stream:stream>"
}

/// Legacy rejection of a stream opener that is not `jabber:client`.
pub fn stream_reject() -> &'static str {
    "</stream>"
}

/// Prepare a parsed stanza for forwarding: stamp the originator as `from`
/// when the sender left it off, serialize, and normalize namespaces.
pub fn prepare_forward(element: &Element, origin_jid: &str) -> String {
    let mut el = element.clone();
    if el.attr("from").is_none() {
        el.set_attr("from", origin_jid);
    }
    clean_forwarded(&String::from(&el))
}

/// Normalize the namespaces of a serialized stanza.
///
/// Serializer prefix artifacts (`xmlns:ns0`) are stripped, `<iq>` loses any
/// inherited default namespace, and `<query>` / `<ping>` re-acquire their
/// canonical ones. The pass is idempotent; applying it twice is a no-op.
pub fn clean_forwarded(xml: &str) -> String {
    let mut s = xml.replace("xmlns:ns0=", "xmlns=").replace("ns0:", "");
    for quote in ['"', '\''] {
        s = s.replace(&format!(" xmlns={q}{j}{q}", q = quote, j = ns::JABBER_CLIENT), "");
        s = s.replace(&format!("<iq xmlns={q}{c}{q}", q = quote, c = ns::CTL), "<iq");
    }
    s = ensure_default_ns(&s, "query", ns::CTL);
    s = ensure_default_ns(&s, "ping", ns::PING);
    s
}

/// Insert `xmlns="{ns_uri}"` into every `<tag …>` open tag that does not
/// already declare a namespace.
fn ensure_default_ns(s: &str, tag: &str, ns_uri: &str) -> String {
    let open = format!("<{}", tag);
    let mut out = String::with_capacity(s.len() + 32);
    let mut rest = s;

    while let Some(pos) = rest.find(&open) {
        let cut = pos + open.len();
        out.push_str(&rest[..cut]);
        let after = &rest[cut..];

        // Only element starts; skip longer names sharing the prefix.
        let at_boundary = matches!(after.chars().next(), None | Some(' ') | Some('>') | Some('/'));
        if at_boundary {
            let open_tag = &after[..after.find('>').unwrap_or(after.len())];
            if !open_tag.contains("xmlns=") {
                out.push_str(&format!(" xmlns=\"{}\"", ns_uri));
            }
        }
        rest = after;
    }

    out.push_str(rest);
    out
}
