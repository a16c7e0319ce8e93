use cita_autobook::core::config::{DelayRange, PacingConfig};
use cita_autobook::testing::{FakeAlarm, FakeElement, FakePage, FakeScreen, FakeSessionFactory};
use cita_autobook::utils::ScreenshotRecorder;
use cita_autobook::{
    AttemptOutcome, Config, CycleSupervisor, FlowVariant, Identity, Pacer, SupervisorExit,
    WorkflowEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

fn identity() -> Identity {
    Identity::from_lookup(FlowVariant::Nie, |key| {
        let value = match key {
            "NIE_DNI" => "x7654321b",
            "FULL_NAME" => "Jan Kowalski",
            "NATIONALITY" => "Polonia",
            "EMAIL" => "jan@example.com",
            "PHONE" => "611222333",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap()
}

fn madrid_screens(availability: FakeScreen) -> Vec<FakeScreen> {
    vec![
        FakeScreen::new(vec![FakeElement::button("Acceder al Procedimiento").goes_to(1)]),
        FakeScreen::new(vec![
            FakeElement::select("form", &[("", "Seleccione"), ("8", "Madrid"), ("7", "Illes Balears")]),
            FakeElement::button("Aceptar").goes_to(2),
        ]),
        FakeScreen::new(vec![
            FakeElement::select(
                "tramiteGrupo[1]",
                &[
                    ("", "Seleccione"),
                    ("4010", "POLICIA-CERTIFICADO DE REGISTRO DE CIUDADANO DE LA U.E."),
                ],
            ),
            FakeElement::button("Aceptar").goes_to(3),
        ]),
        FakeScreen::new(vec![FakeElement::link("Presentación SIN Cl@ve").goes_to(4)]),
        FakeScreen::new(vec![
            FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc"),
            FakeElement::input("txtIdCitado"),
            FakeElement::input("txtDesCitado"),
            FakeElement::select("txtPaisNac", &[("", "Seleccione"), ("120", "POLONIA")]),
            FakeElement::button("Aceptar").goes_to(5),
        ]),
        FakeScreen::new(vec![FakeElement::input_button("Solicitar Cita").goes_to(6)]),
        FakeScreen::new(vec![
            FakeElement::select(
                "sede",
                &[("", "Seleccione"), ("1", "CNP Getafe"), ("2", "CNP Aluche")],
            ),
            FakeElement::button("Siguiente").goes_to(7),
        ]),
        availability,
    ]
}

#[tokio::test(start_paused = true)]
async fn test_toml_portal_settings_drive_the_flow() {
    let mut config = Config::from_toml(
        r#"
            flow = "NIE"

            [portal]
            province = "madrid"

            [portal.nie.office]
            allow = ["aluche"]
            deny = []
        "#,
    )
    .unwrap();
    config.pacing = PacingConfig::instant();

    let page = Arc::new(FakePage::with_screens(madrid_screens(FakeScreen::new(vec![
        FakeElement::text("p", "En este momento no hay citas disponibles."),
    ]))));
    let alarm = Arc::new(FakeAlarm::new(1));
    let (_tx, rx) = watch::channel(false);
    let engine = WorkflowEngine::new(
        Arc::new(config.clone()),
        Arc::new(identity()),
        page.clone(),
        Arc::new(Pacer::seeded(config.pacing.clone(), 5)),
        alarm.clone(),
        ScreenshotRecorder::disabled(),
        rx,
    );

    assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
    assert_eq!(page.value_of("form").as_deref(), Some("8"));
    assert_eq!(page.value_of("sede").as_deref(), Some("2"));
    assert_eq!(page.value_of("txtIdCitado").as_deref(), Some("X7654321B"));
    assert_eq!(page.value_of("txtPaisNac").as_deref(), Some("120"));
    assert_eq!(alarm.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_block_backs_off_then_books_in_a_fresh_session() {
    let blocked = Arc::new(FakePage::new(vec![FakeElement::text(
        "p",
        "The requested URL was rejected. Please consult with your administrator. Your support ID is: 42",
    )]));
    let calendar = FakeScreen::new(vec![
        FakeElement::link("9").wrapped(
            r#"<div class="ui-datepicker"><table><tbody><tr><td>"#,
            "</td></tr></tbody></table></div>",
        ),
        FakeElement::radio("hora1015", "hora"),
        FakeElement::button("Continuar").goes_to(8),
    ]);
    let mut screens = madrid_screens(calendar);
    screens.push(FakeScreen::new(vec![FakeElement::text(
        "p",
        "Su cita ha sido reservada. Localizador: ZX81",
    )]));
    let bookable = Arc::new(FakePage::with_screens(screens));

    let mut config = Config::default();
    config.pacing = PacingConfig::instant();
    config.portal.province = "madrid".to_string();
    config.portal.nie.office.allow = vec!["aluche".to_string()];
    config.retry.retry = DelayRange::secs(30, 30);
    config.retry.backoff = DelayRange::secs(60, 60);
    let config = Arc::new(config);

    let alarm = Arc::new(FakeAlarm::new(2));
    let supervisor = CycleSupervisor::new(
        config.clone(),
        Arc::new(identity()),
        FakeSessionFactory::new(vec![blocked.clone(), bookable.clone()]),
        alarm.clone(),
        ScreenshotRecorder::disabled(),
        Arc::new(Pacer::seeded(config.pacing.clone(), 9)),
    );
    let (_tx, rx) = watch::channel(false);

    let start = Instant::now();
    let exit = supervisor.run_forever(rx).await;
    assert!(matches!(exit, SupervisorExit::Booked(_)));
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert!(blocked.is_closed());
    assert!(!bookable.is_closed());
    assert_eq!(bookable.current_screen(), 8);
    assert_eq!(alarm.starts(), 1);
    assert_eq!(supervisor.factory().live(), 1);
}
