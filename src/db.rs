use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "attaind.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_offerings(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            term TEXT,
            passing_threshold REAL NOT NULL DEFAULT 50.0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            roll_number TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            course_offering_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            PRIMARY KEY(course_offering_id, student_id),
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_components(
            id TEXT PRIMARY KEY,
            course_offering_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_components_offering
         ON assessment_components(course_offering_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            component_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            total_marks REAL NOT NULL,
            question_type TEXT,
            FOREIGN KEY(component_id) REFERENCES assessment_components(id),
            UNIQUE(component_id, number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_component ON questions(component_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clos(
            id TEXT PRIMARY KEY,
            course_offering_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            UNIQUE(course_offering_id, code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_clos(
            question_id TEXT NOT NULL,
            clo_id TEXT NOT NULL,
            PRIMARY KEY(question_id, clo_id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            FOREIGN KEY(clo_id) REFERENCES clos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_clos_clo ON question_clos(clo_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plos(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS plo_clos(
            plo_id TEXT NOT NULL,
            clo_id TEXT NOT NULL,
            PRIMARY KEY(plo_id, clo_id),
            FOREIGN KEY(plo_id) REFERENCES plos(id),
            FOREIGN KEY(clo_id) REFERENCES clos(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_plo_clos_clo ON plo_clos(clo_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            id TEXT PRIMARY KEY,
            grade_scale_id TEXT NOT NULL,
            lower_bound REAL NOT NULL,
            letter TEXT NOT NULL,
            grade_point REAL NOT NULL,
            FOREIGN KEY(grade_scale_id) REFERENCES grade_scales(id),
            UNIQUE(grade_scale_id, lower_bound)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_bands_scale ON grade_bands(grade_scale_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            marks_obtained REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            FOREIGN KEY(component_id) REFERENCES assessment_components(id),
            UNIQUE(student_id, question_id, component_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_question ON marks(question_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_component ON marks(component_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_results(
            id TEXT PRIMARY KEY,
            course_offering_id TEXT NOT NULL UNIQUE,
            grade_scale_id TEXT,
            calc_method TEXT,
            best_of INTEGER,
            status TEXT NOT NULL DEFAULT 'draft',
            calculation_date TEXT,
            publish_date TEXT,
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            FOREIGN KEY(grade_scale_id) REFERENCES grade_scales(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_results(
            course_result_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total_marks REAL NOT NULL,
            max_marks REAL NOT NULL,
            percentage REAL NOT NULL,
            letter_grade TEXT NOT NULL,
            grade_point REAL NOT NULL,
            pass_status TEXT NOT NULL,
            PRIMARY KEY(course_result_id, student_id),
            FOREIGN KEY(course_result_id) REFERENCES course_results(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_results_student
         ON student_results(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS indirect_attainment(
            course_offering_id TEXT NOT NULL,
            clo_id TEXT NOT NULL,
            percentage REAL NOT NULL,
            PRIMARY KEY(course_offering_id, clo_id),
            FOREIGN KEY(course_offering_id) REFERENCES course_offerings(id),
            FOREIGN KEY(clo_id) REFERENCES clos(id)
        )",
        [],
    )?;

    // Workspaces created before marks carried a write timestamp.
    ensure_marks_updated_at(&conn)?;
    // Workspaces created before best_of_n landed.
    ensure_course_results_best_of(&conn)?;

    Ok(conn)
}

fn ensure_marks_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "marks", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE marks ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_course_results_best_of(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "course_results", "best_of")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE course_results ADD COLUMN best_of INTEGER", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
