use super::*;

fn sent(delivery: CodeDelivery) -> SentCode {
    SentCode {
        phone_code_hash: "hash".into(),
        delivery,
        length: Some(5),
    }
}

#[test]
fn code_prompt_names_the_delivery_channel() {
    assert_eq!(code_prompt(&sent(CodeDelivery::Sms)), "Login code (sent by SMS): ");
    assert_eq!(code_prompt(&sent(CodeDelivery::App)), "Login code (sent in the app): ");
}

#[test]
fn password_prompt_shows_hint_when_present() {
    assert_eq!(password_prompt(Some("pet name")), "2FA password (hint: pet name): ");
    assert_eq!(password_prompt(None), "2FA password: ");
}

#[tokio::test]
async fn preset_phone_is_answered_once() {
    let credentials = TerminalCredentials::new(Some("+15550001111".into()));

    assert_eq!(credentials.phone().await.expect("phone"), "+15550001111");
    assert!(credentials.phone.lock().unwrap().is_none());
}
