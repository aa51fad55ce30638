pub const RESET_SUBJECT: &str = "Reset Password - Job Tracker";

pub fn reset_email_html(reset_link: &str) -> String {
    format!(
        r#"<div style="background-color: #f3f4f6; padding: 20px; font-family: sans-serif;">
  <div style="max-width: 600px; margin: 0 auto; background-color: #ffffff; padding: 30px; border-radius: 8px;">
    <h2 style="color: #111827; margin-top: 0;">Reset Your Password</h2>
    <p style="color: #4b5563; line-height: 1.6;">Hello,</p>
    <p style="color: #4b5563; line-height: 1.6;">We received a request to reset your password. Use the button below to choose a new one:</p>
    <div style="text-align: center; margin: 30px 0;">
      <a href="{reset_link}" style="background-color: #6366f1; color: white; padding: 12px 24px; text-decoration: none; border-radius: 6px; font-weight: bold; display: inline-block;">Reset Password</a>
    </div>
    <p style="color: #6b7280; font-size: 12px; margin-top: 30px; border-top: 1px solid #e5e7eb; padding-top: 20px;">
      If you did not request this, ignore this email. The link will expire in 15 minutes.
    </p>
  </div>
</div>"#
    )
}
