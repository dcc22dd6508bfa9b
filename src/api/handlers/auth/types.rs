use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    #[serde(rename = "returnTo")]
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct JoinForm {
    pub email: String,
    pub username: String,
    pub name: String,
    pub password: String,
    #[serde(rename = "confirmPassword")]
    pub confirm_password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetRequestForm {
    pub email: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetForm {
    pub password: String,
    #[serde(rename = "passwordConfirm")]
    pub password_confirm: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangePasswordForm {
    #[serde(rename = "currentPassword", default)]
    pub current_password: Option<String>,
    #[serde(rename = "newPassword")]
    pub new_password: String,
    #[serde(rename = "newPasswordConfirm")]
    pub new_password_confirm: String,
}
