use axum::extract::Query;
use maud::{html, Markup, PreEscaped, DOCTYPE};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

const EXCHANGE_SCRIPT: &str = r#"
document.getElementById('exchange').addEventListener('submit', async (event) => {
  event.preventDefault();
  const form = event.target;
  const out = document.getElementById('result');
  out.textContent = 'Exchanging…';
  try {
    const res = await fetch('/api/atprotocol/token', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify({ code: form.code.value, state: form.state.value }),
    });
    const body = await res.json();
    out.textContent = res.status + '\n' + JSON.stringify(body, null, 2);
  } catch (err) {
    out.textContent = 'Request failed: ' + err;
  }
});
"#;

/// Development-only landing page for the authorization redirect
pub async fn callback(Query(params): Query<CallbackParams>) -> Markup {
    let code = params.code.unwrap_or_default();
    let state = params.state.unwrap_or_default();

    html! {
        (DOCTYPE)
        html {
            head {
                title { "langbird dev callback" }
                meta name="viewport" content="width=device-width, initial-scale=1.0";
            }
            body {
                h1 { "Authorization callback" }

                @if let Some(error) = &params.error {
                    p { strong { "Provider error: " } (error) }
                    @if let Some(description) = &params.error_description {
                        p { (description) }
                    }
                }

                form id="exchange" {
                    p {
                        label for="code" { "code" } br;
                        input id="code" name="code" size="80" value=(code);
                    }
                    p {
                        label for="state" { "state" } br;
                        input id="state" name="state" size="80" value=(state);
                    }
                    button type="submit" { "Exchange for session" }
                }

                pre id="result" {}
                script { (PreEscaped(EXCHANGE_SCRIPT)) }
            }
        }
    }
}
