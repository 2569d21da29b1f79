use anyhow::Result;
use serde_json::json;

use crate::api::RegisterRequest;
use crate::client::{ApiClient, Session};
use crate::config::Config;

use super::helpers::{password_or_prompt, require_session};

pub(crate) async fn cmd_register(
    config: &Config,
    server: &str,
    username: &str,
    email: &str,
    password: Option<String>,
    goal: i64,
    json: bool,
) -> Result<()> {
    let password = password_or_prompt(password)?;
    let client = ApiClient::new(server)?;
    let session = client
        .register(&RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password,
            daily_calorie_goal: goal,
        })
        .await?;
    session.save(&config.session_path())?;

    if json {
        println!(
            "{}",
            json!({ "username": session.username, "server_url": session.server_url })
        );
    } else {
        let name = &session.username;
        let url = &session.server_url;
        println!("Registered and logged in as {name} on {url}");
    }
    Ok(())
}

pub(crate) async fn cmd_login(
    config: &Config,
    server: &str,
    username: &str,
    password: Option<String>,
    json: bool,
) -> Result<()> {
    let password = password_or_prompt(password)?;
    let client = ApiClient::new(server)?;
    let session = client.login(username, &password).await?;
    session.save(&config.session_path())?;

    if json {
        println!(
            "{}",
            json!({ "username": session.username, "server_url": session.server_url })
        );
    } else {
        let name = &session.username;
        let url = &session.server_url;
        println!("Logged in as {name} on {url}");
    }
    Ok(())
}

pub(crate) fn cmd_logout(config: &Config, json: bool) -> Result<()> {
    let removed = Session::clear(&config.session_path())?;
    if json {
        println!("{}", json!({ "logged_out": removed }));
    } else if removed {
        println!("Logged out");
    } else {
        println!("Not logged in");
    }
    Ok(())
}

pub(crate) async fn cmd_me(config: &Config, json: bool) -> Result<()> {
    let session = require_session(config)?;
    let profile = ApiClient::for_session(&session)?.me(&session).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        let name = &profile.username;
        let email = &profile.email;
        let goal = profile.daily_calorie_goal;
        let url = &session.server_url;
        println!("{name} <{email}>");
        println!("  Daily goal: {goal} kcal");
        println!("  Server:     {url}");
    }
    Ok(())
}

pub(crate) async fn cmd_goal(config: &Config, calories: i64, json: bool) -> Result<()> {
    let session = require_session(config)?;
    let profile = ApiClient::for_session(&session)?
        .update_goal(&session, calories)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        let goal = profile.daily_calorie_goal;
        println!("Daily calorie goal set to {goal} kcal");
    }
    Ok(())
}
